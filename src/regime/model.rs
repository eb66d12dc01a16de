// =============================================================================
// Regime Model — Gaussian HMM parameters held in log space
// =============================================================================
//
// Invariants maintained by every constructor and by the trainer:
//   - log-sum-exp(log_initial) == 0 and every transition row log-sums to 0.
//   - every variance entry is >= the configured floor (never singular).
//   - `labels[i]` is derived from state i's first-dimension statistics.
// =============================================================================

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RegimeError, Result};
use crate::regime::math::{log_sum_exp, safe_ln};
use crate::runtime_config::HmmParams;

/// Tolerance on row sums when importing raw parameters.
const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// Entries are log-probabilities (`-inf` allowed, NaN and `+inf` not) whose
/// log-sum `total` is zero within tolerance.
fn is_log_distribution(row: &[f64], total: f64) -> bool {
    row.iter().all(|v| !v.is_nan() && *v != f64::INFINITY)
        && total.is_finite()
        && total.abs() <= ROW_SUM_TOLERANCE
}

// =============================================================================
// State labels
// =============================================================================

/// Semantic tag for a hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateLabel {
    BullishStable,
    BullishVolatile,
    BearishStable,
    BearishVolatile,
    Lateral,
}

impl StateLabel {
    /// Classify from price-return mean and variance.
    ///
    /// Only the price-return dimension feeds the label; the volume dimension
    /// shapes training but is not consulted here.
    pub fn classify(mean_return: f64, return_variance: f64, lateral_band: f64, volatile_std: f64) -> Self {
        if mean_return.abs() < lateral_band {
            return Self::Lateral;
        }
        let volatile = return_variance.sqrt() > volatile_std;
        match (mean_return > 0.0, volatile) {
            (true, false) => Self::BullishStable,
            (true, true) => Self::BullishVolatile,
            (false, false) => Self::BearishStable,
            (false, true) => Self::BearishVolatile,
        }
    }

    pub fn is_bullish(self) -> bool {
        matches!(self, Self::BullishStable | Self::BullishVolatile)
    }

    pub fn is_bearish(self) -> bool {
        matches!(self, Self::BearishStable | Self::BearishVolatile)
    }

    pub fn is_volatile(self) -> bool {
        matches!(self, Self::BullishVolatile | Self::BearishVolatile)
    }
}

impl std::fmt::Display for StateLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BullishStable => write!(f, "BULLISH_STABLE"),
            Self::BullishVolatile => write!(f, "BULLISH_VOLATILE"),
            Self::BearishStable => write!(f, "BEARISH_STABLE"),
            Self::BearishVolatile => write!(f, "BEARISH_VOLATILE"),
            Self::Lateral => write!(f, "LATERAL"),
        }
    }
}

// =============================================================================
// Raw parameter arrays
// =============================================================================

/// Plain-array view of a model, for callers that want to store or transfer
/// a fitted model themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub log_initial: Vec<f64>,
    pub log_transitions: Vec<Vec<f64>>,
    pub means: Vec<Vec<f64>>,
    pub variances: Vec<Vec<f64>>,
}

// =============================================================================
// RegimeModel
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RegimeModel {
    pub(crate) log_initial: Array1<f64>,
    pub(crate) log_transitions: Array2<f64>,
    pub(crate) means: Array2<f64>,
    pub(crate) variances: Array2<f64>,
    pub(crate) labels: Vec<StateLabel>,
}

impl RegimeModel {
    /// Seed a fresh model from the global statistics of `observations`.
    ///
    /// Each state's mean is the global mean plus a uniform offset in
    /// `[-std, std]` per dimension; this is what breaks the symmetry between
    /// states, so `rng` must be seeded for reproducible fits.
    pub fn initialize<R: Rng + ?Sized>(observations: ArrayView2<f64>, hmm: &HmmParams, rng: &mut R) -> Self {
        let n = hmm.n_states.max(1);
        let d = observations.ncols();

        let global_mean = observations
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(d));
        let global_var = observations.var_axis(Axis(0), 0.0);

        let log_initial = Array1::from_elem(n, -(n as f64).ln());

        let log_transitions = if n == 1 {
            Array2::zeros((1, 1))
        } else {
            let stay = hmm.self_transition.clamp(0.0, 1.0);
            let leave = (1.0 - stay) / (n - 1) as f64;
            Array2::from_shape_fn((n, n), |(i, j)| safe_ln(if i == j { stay } else { leave }))
        };

        let mut means = Array2::zeros((n, d));
        let mut variances = Array2::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                let var = global_var[k].max(hmm.variance_floor);
                let offset: f64 = rng.gen_range(-1.0..=1.0);
                means[[i, k]] = global_mean[k] + offset * var.sqrt();
                variances[[i, k]] = var;
            }
        }

        let mut model = Self {
            log_initial,
            log_transitions,
            means,
            variances,
            labels: Vec::new(),
        };
        model.relabel(hmm);
        model
    }

    pub fn n_states(&self) -> usize {
        self.log_initial.len()
    }

    pub fn n_dims(&self) -> usize {
        self.means.ncols()
    }

    pub fn label(&self, state: usize) -> StateLabel {
        self.labels.get(state).copied().unwrap_or(StateLabel::Lateral)
    }

    /// Recompute every state label from the current first-dimension stats.
    pub fn relabel(&mut self, hmm: &HmmParams) {
        self.labels = (0..self.n_states())
            .map(|i| {
                StateLabel::classify(
                    self.means[[i, 0]],
                    self.variances[[i, 0]],
                    hmm.lateral_band,
                    hmm.volatile_std,
                )
            })
            .collect();
    }

    /// True when every parameter is finite (log transitions may be very
    /// negative but never NaN or +inf).
    pub fn is_finite(&self) -> bool {
        self.log_initial.iter().all(|v| !v.is_nan() && *v != f64::INFINITY)
            && self.log_transitions.iter().all(|v| !v.is_nan() && *v != f64::INFINITY)
            && self.means.iter().all(|v| v.is_finite())
            && self.variances.iter().all(|v| v.is_finite() && *v > 0.0)
    }

    pub fn to_params(&self) -> ModelParams {
        ModelParams {
            log_initial: self.log_initial.to_vec(),
            log_transitions: self.log_transitions.outer_iter().map(|r| r.to_vec()).collect(),
            means: self.means.outer_iter().map(|r| r.to_vec()).collect(),
            variances: self.variances.outer_iter().map(|r| r.to_vec()).collect(),
        }
    }

    /// Rebuild a model from raw arrays, checking the model invariants.
    pub fn from_params(params: &ModelParams, hmm: &HmmParams) -> Result<Self> {
        let n = params.log_initial.len();
        if n == 0 {
            return Err(RegimeError::InvalidParams("no states".into()));
        }
        if params.log_transitions.len() != n || params.means.len() != n || params.variances.len() != n {
            return Err(RegimeError::InvalidParams(format!(
                "state count mismatch: initial={n}, transitions={}, means={}, variances={}",
                params.log_transitions.len(),
                params.means.len(),
                params.variances.len()
            )));
        }
        let d = params.means[0].len();
        if d == 0 {
            return Err(RegimeError::InvalidParams("zero-dimensional emissions".into()));
        }

        let initial_sum = log_sum_exp(&params.log_initial);
        if !is_log_distribution(&params.log_initial, initial_sum) {
            return Err(RegimeError::InvalidParams(format!(
                "initial distribution log-sums to {initial_sum}"
            )));
        }

        let mut log_transitions = Array2::zeros((n, n));
        for (i, row) in params.log_transitions.iter().enumerate() {
            if row.len() != n {
                return Err(RegimeError::InvalidParams(format!("transition row {i} has {} entries", row.len())));
            }
            let s = log_sum_exp(row);
            if !is_log_distribution(row, s) {
                return Err(RegimeError::InvalidParams(format!("transition row {i} log-sums to {s}")));
            }
            for (j, &v) in row.iter().enumerate() {
                log_transitions[[i, j]] = v;
            }
        }

        let mut means = Array2::zeros((n, d));
        let mut variances = Array2::zeros((n, d));
        for i in 0..n {
            if params.means[i].len() != d || params.variances[i].len() != d {
                return Err(RegimeError::InvalidParams(format!("state {i} has wrong dimensionality")));
            }
            for k in 0..d {
                let mu = params.means[i][k];
                let var = params.variances[i][k];
                if !mu.is_finite() || !var.is_finite() || var < hmm.variance_floor {
                    return Err(RegimeError::InvalidParams(format!(
                        "state {i} dim {k}: mean={mu}, variance={var}"
                    )));
                }
                means[[i, k]] = mu;
                variances[[i, k]] = var;
            }
        }

        let mut model = Self {
            log_initial: Array1::from(params.log_initial.clone()),
            log_transitions,
            means,
            variances,
            labels: Vec::new(),
        };
        model.relabel(hmm);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params(n: usize) -> HmmParams {
        HmmParams {
            n_states: n,
            ..HmmParams::default()
        }
    }

    fn sample_obs() -> Array2<f64> {
        Array2::from_shape_fn((200, 2), |(t, k)| {
            let x = (t as f64 * 0.37 + k as f64).sin();
            if k == 0 {
                x * 0.01
            } else {
                x * 0.2
            }
        })
    }

    #[test]
    fn classify_labels() {
        assert_eq!(StateLabel::classify(0.01, 0.0001, 0.0005, 0.015), StateLabel::BullishStable);
        assert_eq!(StateLabel::classify(0.01, 0.0009, 0.0005, 0.015), StateLabel::BullishVolatile);
        assert_eq!(StateLabel::classify(-0.01, 0.0001, 0.0005, 0.015), StateLabel::BearishStable);
        assert_eq!(StateLabel::classify(-0.01, 0.0009, 0.0005, 0.015), StateLabel::BearishVolatile);
        assert_eq!(StateLabel::classify(0.0001, 0.0009, 0.0005, 0.015), StateLabel::Lateral);

        let lateral = StateLabel::Lateral;
        assert!(!lateral.is_bullish() && !lateral.is_bearish());
        assert!(StateLabel::BearishVolatile.is_bearish() && StateLabel::BearishVolatile.is_volatile());
        assert!(StateLabel::BullishStable.is_bullish() && !StateLabel::BullishStable.is_volatile());
    }

    #[test]
    fn label_ignores_volume_dimension() {
        let hmm = params(2);
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut rng);
        model.means[[0, 0]] = 0.01;
        model.variances[[0, 0]] = 1e-5;
        model.relabel(&hmm);
        let before = model.label(0);

        model.means[[0, 1]] = -5.0;
        model.variances[[0, 1]] = 100.0;
        model.relabel(&hmm);
        assert_eq!(model.label(0), before);
        assert_eq!(before, StateLabel::BullishStable);
    }

    #[test]
    fn initialization_is_stochastic_and_normalised() {
        let hmm = params(8);
        let mut rng = StdRng::seed_from_u64(7);
        let model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut rng);

        assert_eq!(model.n_states(), 8);
        assert_eq!(model.n_dims(), 2);
        assert!(log_sum_exp(model.log_initial.as_slice().unwrap()).abs() < 1e-12);
        for row in model.log_transitions.outer_iter() {
            assert!(log_sum_exp(&row.to_vec()).abs() < 1e-12);
        }
        assert!((model.log_transitions[[0, 0]].exp() - 0.95).abs() < 1e-12);
        // states must not all share the same mean
        assert!((model.means[[0, 0]] - model.means[[1, 0]]).abs() > 0.0);
        assert!(model.variances.iter().all(|v| *v >= hmm.variance_floor));
    }

    #[test]
    fn same_seed_same_model() {
        let hmm = params(4);
        let a = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(42));
        let b = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn params_roundtrip_is_exact() {
        let hmm = params(3);
        let model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(3));
        let json = serde_json::to_string(&model.to_params()).unwrap();
        let raw: ModelParams = serde_json::from_str(&json).unwrap();
        let back = RegimeModel::from_params(&raw, &hmm).unwrap();
        assert_eq!(model, back);
    }

    #[test]
    fn from_params_rejects_bad_rows() {
        let hmm = params(2);
        let model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(3));
        let mut raw = model.to_params();
        raw.log_transitions[1][0] = 0.0;
        assert!(matches!(RegimeModel::from_params(&raw, &hmm), Err(RegimeError::InvalidParams(_))));

        let mut raw = model.to_params();
        raw.variances[0][1] = 0.0;
        assert!(RegimeModel::from_params(&raw, &hmm).is_err());
    }

    #[test]
    fn from_params_rejects_nan_probabilities() {
        let hmm = params(2);
        let model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(3));

        let mut raw = model.to_params();
        raw.log_initial = vec![f64::NAN, 0.0];
        assert!(matches!(RegimeModel::from_params(&raw, &hmm), Err(RegimeError::InvalidParams(_))));

        let mut raw = model.to_params();
        raw.log_transitions[0] = vec![f64::NAN, 0.0];
        assert!(matches!(RegimeModel::from_params(&raw, &hmm), Err(RegimeError::InvalidParams(_))));
    }

    #[test]
    fn from_params_accepts_impossible_transitions() {
        let hmm = params(2);
        let model = RegimeModel::initialize(sample_obs().view(), &hmm, &mut StdRng::seed_from_u64(3));
        let mut raw = model.to_params();
        raw.log_transitions[0] = vec![0.0, f64::NEG_INFINITY];
        assert!(RegimeModel::from_params(&raw, &hmm).is_ok());
    }
}
