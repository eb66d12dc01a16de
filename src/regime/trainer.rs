// =============================================================================
// Baum-Welch Trainer — EM for the Gaussian HMM, entirely in log space
// =============================================================================
//
// One iteration:
//
//   1. Forward    alpha[0][i] = ln pi_i + ln b_i(o_0)
//                 alpha[t][j] = lse_i(alpha[t-1][i] + ln a_ij) + ln b_j(o_t)
//   2. Backward   beta[T-1][i] = 0
//                 beta[t][i]   = lse_j(ln a_ij + ln b_j(o_t+1) + beta[t+1][j])
//   3. LL         lse_i(alpha[T-1][i]); NaN / -inf aborts and keeps the last
//                 good parameters.
//   4. E-step     gamma[t][i] = exp(alpha + beta - LL)
//                 xi[t][i][j] = exp(alpha[t][i] + ln a_ij + ln b_j(o_t+1)
//                                   + beta[t+1][j] - LL)
//   5. M-step     pi, A, per-state means / variances (variance floored).
//   6. Stop       |LL_t - LL_t-1| < tolerance, or the iteration cap.
//
// The alpha / beta / gamma / emission tables are owned by the trainer and
// reused across calls; they are only reallocated when T, N or D change.
// =============================================================================

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::regime::math::{log_gaussian_pdf, log_sum_exp, safe_ln};
use crate::regime::model::RegimeModel;
use crate::runtime_config::HmmParams;

/// Below this total responsibility a state keeps its previous parameters.
const MIN_STATE_WEIGHT: f64 = 1e-10;

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Too few observations; nothing was touched.
    Skipped,
    /// Log-likelihood change fell below the tolerance.
    Converged,
    /// Iteration cap reached before convergence.
    MaxIterations,
    /// Log-likelihood went non-finite; the last good parameters were kept.
    Diverged,
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Converged => write!(f, "CONVERGED"),
            Self::MaxIterations => write!(f, "MAX_ITERATIONS"),
            Self::Diverged => write!(f, "DIVERGED"),
        }
    }
}

/// Outcome of one `train` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub status: TrainingStatus,
    /// Number of E-steps that produced a finite log-likelihood.
    pub iterations: usize,
    /// Log-likelihood of the parameters in force at each accepted iteration.
    pub log_likelihoods: Vec<f64>,
}

impl TrainingReport {
    pub fn skipped() -> Self {
        Self {
            status: TrainingStatus::Skipped,
            iterations: 0,
            log_likelihoods: Vec::new(),
        }
    }

    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.log_likelihoods.last().copied()
    }
}

// =============================================================================
// BaumWelch
// =============================================================================

/// Reusable Baum-Welch workspace.
#[derive(Debug, Default)]
pub struct BaumWelch {
    log_emission: Array2<f64>,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    gamma: Array2<f64>,
    xi_sum: Array2<f64>,
    term: Vec<f64>,
}

impl BaumWelch {
    pub fn new() -> Self {
        Self::default()
    }

    fn prepare(&mut self, t: usize, n: usize) {
        if self.alpha.dim() != (t, n) {
            self.log_emission = Array2::zeros((t, n));
            self.alpha = Array2::zeros((t, n));
            self.beta = Array2::zeros((t, n));
            self.gamma = Array2::zeros((t, n));
        }
        if self.xi_sum.dim() != (n, n) {
            self.xi_sum = Array2::zeros((n, n));
        }
        self.term.resize(n, 0.0);
    }

    fn compute_emissions(&mut self, model: &RegimeModel, obs: ArrayView2<f64>) {
        for (t, o) in obs.outer_iter().enumerate() {
            for j in 0..model.n_states() {
                self.log_emission[[t, j]] =
                    log_gaussian_pdf(o, model.means.row(j), model.variances.row(j));
            }
        }
    }

    /// Forward pass; returns the sequence log-likelihood.
    fn forward(&mut self, model: &RegimeModel) -> f64 {
        let (t_len, n) = self.alpha.dim();
        for j in 0..n {
            self.alpha[[0, j]] = model.log_initial[j] + self.log_emission[[0, j]];
        }
        for t in 1..t_len {
            for j in 0..n {
                for i in 0..n {
                    self.term[i] = self.alpha[[t - 1, i]] + model.log_transitions[[i, j]];
                }
                self.alpha[[t, j]] = log_sum_exp(&self.term) + self.log_emission[[t, j]];
            }
        }
        for j in 0..n {
            self.term[j] = self.alpha[[t_len - 1, j]];
        }
        log_sum_exp(&self.term)
    }

    fn backward(&mut self, model: &RegimeModel) {
        let (t_len, n) = self.beta.dim();
        for i in 0..n {
            self.beta[[t_len - 1, i]] = 0.0;
        }
        for t in (0..t_len - 1).rev() {
            for i in 0..n {
                for j in 0..n {
                    self.term[j] = model.log_transitions[[i, j]]
                        + self.log_emission[[t + 1, j]]
                        + self.beta[[t + 1, j]];
                }
                self.beta[[t, i]] = log_sum_exp(&self.term);
            }
        }
    }

    /// E-step + M-step. Returns re-estimated parameters without touching
    /// `model`.
    fn reestimate(&mut self, model: &RegimeModel, obs: ArrayView2<f64>, log_likelihood: f64, hmm: &HmmParams) -> RegimeModel {
        let (t_len, n) = self.alpha.dim();
        let d = obs.ncols();

        // --- E-step: state posteriors ------------------------------------------
        let mut weight = Array1::<f64>::zeros(n);
        let mut weight_trans = Array1::<f64>::zeros(n);
        for t in 0..t_len {
            for i in 0..n {
                let g = (self.alpha[[t, i]] + self.beta[[t, i]] - log_likelihood).exp();
                self.gamma[[t, i]] = g;
                weight[i] += g;
                if t + 1 < t_len {
                    weight_trans[i] += g;
                }
            }
        }

        // --- E-step: expected transition counts ---------------------------------
        self.xi_sum.fill(0.0);
        for t in 0..t_len.saturating_sub(1) {
            for i in 0..n {
                let head = self.alpha[[t, i]] - log_likelihood;
                for j in 0..n {
                    let log_xi = head
                        + model.log_transitions[[i, j]]
                        + self.log_emission[[t + 1, j]]
                        + self.beta[[t + 1, j]];
                    self.xi_sum[[i, j]] += log_xi.exp();
                }
            }
        }

        let mut next = model.clone();

        // --- M-step: initial distribution -------------------------------------
        let pi_total: f64 = self.gamma.row(0).sum();
        if pi_total > MIN_STATE_WEIGHT {
            for i in 0..n {
                next.log_initial[i] = safe_ln(self.gamma[[0, i]] / pi_total);
            }
        }

        // --- M-step: transitions ----------------------------------------------
        for i in 0..n {
            if weight_trans[i] <= MIN_STATE_WEIGHT {
                continue;
            }
            let row_total: f64 = (0..n).map(|j| self.xi_sum[[i, j]] / weight_trans[i]).sum();
            if row_total <= MIN_STATE_WEIGHT {
                continue;
            }
            for j in 0..n {
                next.log_transitions[[i, j]] = safe_ln(self.xi_sum[[i, j]] / weight_trans[i] / row_total);
            }
        }

        // --- M-step: emissions ---------------------------------------------------
        for i in 0..n {
            if weight[i] <= MIN_STATE_WEIGHT {
                continue;
            }
            for k in 0..d {
                let mut mu = 0.0;
                for t in 0..t_len {
                    mu += self.gamma[[t, i]] * obs[[t, k]];
                }
                mu /= weight[i];

                let mut var = 0.0;
                for t in 0..t_len {
                    let diff = obs[[t, k]] - mu;
                    var += self.gamma[[t, i]] * diff * diff;
                }
                var /= weight[i];

                next.means[[i, k]] = mu;
                next.variances[[i, k]] = var.max(hmm.variance_floor);
            }
        }

        next
    }

    /// Log-likelihood of `obs` under `model`, without re-estimating.
    pub fn log_likelihood(&mut self, model: &RegimeModel, obs: ArrayView2<f64>) -> f64 {
        if obs.nrows() == 0 {
            return f64::NEG_INFINITY;
        }
        self.prepare(obs.nrows(), model.n_states());
        self.compute_emissions(model, obs);
        self.forward(model)
    }

    /// Run EM on `model` in place.
    ///
    /// Parameters are only replaced after a finite E-step; a non-finite
    /// log-likelihood restores the last parameters that produced a finite one.
    pub fn fit(&mut self, model: &mut RegimeModel, obs: ArrayView2<f64>, max_iterations: usize, hmm: &HmmParams) -> TrainingReport {
        let t_len = obs.nrows();
        if t_len == 0 {
            return TrainingReport::skipped();
        }
        self.prepare(t_len, model.n_states());

        info!(
            observations = t_len,
            states = model.n_states(),
            max_iterations,
            "Baum-Welch training started"
        );

        let mut log_likelihoods = Vec::new();
        let mut last_good: Option<RegimeModel> = None;
        let mut status = TrainingStatus::MaxIterations;

        for iteration in 0..max_iterations {
            self.compute_emissions(model, obs);
            let ll = self.forward(model);

            if !ll.is_finite() {
                debug!(iteration, log_likelihood = ll, "non-finite log-likelihood, keeping last good parameters");
                if let Some(good) = last_good.take() {
                    *model = good;
                }
                status = TrainingStatus::Diverged;
                break;
            }

            trace!(iteration, log_likelihood = ll, "EM iteration");
            let previous = log_likelihoods.last().copied();
            log_likelihoods.push(ll);

            if let Some(prev) = previous {
                if (ll - prev).abs() < hmm.convergence_tolerance {
                    status = TrainingStatus::Converged;
                    break;
                }
            }

            self.backward(model);
            let next = self.reestimate(model, obs, ll, hmm);
            if !next.is_finite() {
                debug!(iteration, "degenerate M-step, keeping current parameters");
                status = TrainingStatus::Diverged;
                break;
            }
            last_good = Some(std::mem::replace(model, next));
        }

        // The final M-step of a capped run has not been scored yet.
        if status == TrainingStatus::MaxIterations && !log_likelihoods.is_empty() {
            let ll = self.log_likelihood(model, obs);
            if !ll.is_finite() {
                debug!(log_likelihood = ll, "final parameters diverged, rolling back");
                if let Some(good) = last_good.take() {
                    *model = good;
                }
                status = TrainingStatus::Diverged;
            }
        }

        if !log_likelihoods.is_empty() {
            model.relabel(hmm);
        }

        info!(
            status = %status,
            iterations = log_likelihoods.len(),
            log_likelihood = log_likelihoods.last().copied().unwrap_or(f64::NAN),
            "Baum-Welch training finished"
        );

        TrainingReport {
            status,
            iterations: log_likelihoods.len(),
            log_likelihoods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn hmm(n: usize) -> HmmParams {
        HmmParams {
            n_states: n,
            ..HmmParams::default()
        }
    }

    /// Alternating blocks of (mean, std) for the return dimension, small
    /// noise on the volume dimension.
    fn two_regime_obs(len: usize, block: usize, seed: u64) -> (Array2<f64>, Vec<bool>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let calm = Normal::new(0.01, 0.005).unwrap();
        let wild = Normal::new(-0.01, 0.03).unwrap();
        let vol = Normal::new(0.0, 0.05).unwrap();
        let mut obs = Array2::zeros((len, 2));
        let mut planted = Vec::with_capacity(len);
        for t in 0..len {
            let is_calm = (t / block) % 2 == 0;
            obs[[t, 0]] = if is_calm { calm.sample(&mut rng) } else { wild.sample(&mut rng) };
            obs[[t, 1]] = vol.sample(&mut rng);
            planted.push(is_calm);
        }
        (obs, planted)
    }

    #[test]
    fn log_likelihood_is_non_decreasing() {
        let (obs, _) = two_regime_obs(400, 50, 11);
        let params = hmm(3);
        let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(5));
        let mut bw = BaumWelch::new();
        let report = bw.fit(&mut model, obs.view(), 60, &params);

        assert!(report.iterations >= 2);
        assert_ne!(report.status, TrainingStatus::Diverged);
        for w in report.log_likelihoods.windows(2) {
            let tol = 1e-6 * w[0].abs().max(1.0);
            assert!(w[1] >= w[0] - tol, "LL decreased: {} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn parameters_stay_normalised_after_training() {
        let (obs, _) = two_regime_obs(300, 50, 2);
        let params = hmm(4);
        let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(9));
        BaumWelch::new().fit(&mut model, obs.view(), 30, &params);

        assert!(log_sum_exp(&model.log_initial.to_vec()).abs() < 1e-9);
        for row in model.log_transitions.outer_iter() {
            assert!(log_sum_exp(&row.to_vec()).abs() < 1e-9);
        }
        assert!(model.variances.iter().all(|v| *v >= params.variance_floor));
        assert!(model.is_finite());
    }

    #[test]
    fn stops_at_iteration_cap() {
        let (obs, _) = two_regime_obs(200, 50, 4);
        let params = HmmParams {
            convergence_tolerance: 0.0,
            ..hmm(2)
        };
        let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(1));
        let report = BaumWelch::new().fit(&mut model, obs.view(), 3, &params);
        assert_eq!(report.status, TrainingStatus::MaxIterations);
        assert_eq!(report.iterations, 3);
    }

    #[test]
    fn non_finite_observations_abort_without_mutation() {
        let (mut obs, _) = two_regime_obs(200, 50, 4);
        let params = hmm(2);
        let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(1));
        let before = model.clone();
        obs[[10, 0]] = f64::NAN;

        let report = BaumWelch::new().fit(&mut model, obs.view(), 10, &params);
        assert_eq!(report.status, TrainingStatus::Diverged);
        assert_eq!(report.iterations, 0);
        assert_eq!(model, before);
    }

    #[test]
    fn same_seed_same_convergence_path() {
        let (obs, _) = two_regime_obs(300, 50, 8);
        let params = hmm(3);
        let run = || {
            let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(21));
            let report = BaumWelch::new().fit(&mut model, obs.view(), 25, &params);
            (model, report)
        };
        let (m1, r1) = run();
        let (m2, r2) = run();
        assert_eq!(r1, r2);
        assert_eq!(m1, m2);
    }

    #[test]
    fn workspace_is_reused_for_same_shape() {
        let (obs, _) = two_regime_obs(150, 50, 1);
        let params = hmm(2);
        let mut model = RegimeModel::initialize(obs.view(), &params, &mut StdRng::seed_from_u64(1));
        let mut bw = BaumWelch::new();
        bw.fit(&mut model, obs.view(), 2, &params);
        let ptr = bw.alpha.as_ptr();
        bw.fit(&mut model, obs.view(), 2, &params);
        assert_eq!(ptr, bw.alpha.as_ptr());
    }
}
