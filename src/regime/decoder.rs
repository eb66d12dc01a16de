// =============================================================================
// Viterbi Decoder — max-product decoding in log space
// =============================================================================
//
//   delta[0][j] = ln pi_j + ln b_j(o_0)
//   delta[t][j] = max_i(delta[t-1][i] + ln a_ij) + ln b_j(o_t)
//   psi[t][j]   = argmax_i(...)
//
// The terminal state is argmax_j delta[T-1][j].  Its reported probability is
// that state's share of the terminal best-path mass,
//
//   exp(delta[T-1][best] - lse_j delta[T-1][j])
//
// which always lies in (0, 1].
// =============================================================================

use ndarray::{Array2, ArrayView2};

use crate::regime::math::{log_gaussian_pdf, log_sum_exp};
use crate::regime::model::RegimeModel;

/// Result of decoding one observation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViterbiOutcome {
    pub terminal_state: usize,
    /// Log joint density of the best path.
    pub path_log_prob: f64,
    /// Terminal state's normalised share of best-path mass.
    pub probability: f64,
}

/// Reusable `delta` / `psi` tables.
#[derive(Debug, Default)]
pub struct Viterbi {
    delta: Array2<f64>,
    psi: Array2<usize>,
    term: Vec<f64>,
    len: usize,
}

impl Viterbi {
    pub fn new() -> Self {
        Self::default()
    }

    fn prepare(&mut self, t: usize, n: usize) {
        // Grow only; shorter windows reuse the leading rows.
        if self.delta.nrows() < t || self.delta.ncols() != n {
            self.delta = Array2::zeros((t, n));
            self.psi = Array2::zeros((t, n));
        }
        self.term.resize(n, 0.0);
        self.len = t;
    }

    /// Decode `obs`; `None` for an empty window or a non-finite result.
    pub fn decode(&mut self, model: &RegimeModel, obs: ArrayView2<f64>) -> Option<ViterbiOutcome> {
        let t_len = obs.nrows();
        let n = model.n_states();
        if t_len == 0 || n == 0 {
            return None;
        }
        self.prepare(t_len, n);

        let o0 = obs.row(0);
        for j in 0..n {
            self.delta[[0, j]] = model.log_initial[j]
                + log_gaussian_pdf(o0, model.means.row(j), model.variances.row(j));
            self.psi[[0, j]] = 0;
        }

        for t in 1..t_len {
            let ot = obs.row(t);
            for j in 0..n {
                let mut best_val = f64::NEG_INFINITY;
                let mut best_state = 0;
                for i in 0..n {
                    let val = self.delta[[t - 1, i]] + model.log_transitions[[i, j]];
                    if val > best_val {
                        best_val = val;
                        best_state = i;
                    }
                }
                self.delta[[t, j]] =
                    best_val + log_gaussian_pdf(ot, model.means.row(j), model.variances.row(j));
                self.psi[[t, j]] = best_state;
            }
        }

        let last = t_len - 1;
        let mut terminal_state = 0;
        let mut path_log_prob = f64::NEG_INFINITY;
        for j in 0..n {
            self.term[j] = self.delta[[last, j]];
            if self.delta[[last, j]] > path_log_prob {
                path_log_prob = self.delta[[last, j]];
                terminal_state = j;
            }
        }
        if !path_log_prob.is_finite() {
            return None;
        }

        let probability = (path_log_prob - log_sum_exp(&self.term)).exp().min(1.0);

        Some(ViterbiOutcome {
            terminal_state,
            path_log_prob,
            probability,
        })
    }

    /// Backtrack the most probable state path of the last `decode` call.
    pub fn path(&self, terminal_state: usize) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut path = vec![0; self.len];
        path[self.len - 1] = terminal_state;
        for t in (0..self.len - 1).rev() {
            path[t] = self.psi[[t + 1, path[t + 1]]];
        }
        path
    }
}
