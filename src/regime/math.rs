// =============================================================================
// Log-space numerics
// =============================================================================
//
// Every probability in the trainer and decoder is carried as a logarithm.
// `log_sum_exp` uses the subtract-max identity
//
//   ln Σ exp(x_i) = m + ln Σ exp(x_i - m),   m = max x_i
//
// so that sequences of a few thousand observations never underflow.
// =============================================================================

use std::f64::consts::PI;

use ndarray::ArrayView1;

/// Floor applied to probabilities before taking the log.
pub const MIN_PROB: f64 = 1e-300;

/// Numerically stable `ln Σ exp(x_i)`.
///
/// Returns `-inf` for an empty slice or when every term is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        // +inf or NaN poisons the sum either way.
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `ln p` with `p` floored at [`MIN_PROB`].
pub fn safe_ln(p: f64) -> f64 {
    p.max(MIN_PROB).ln()
}

/// Log-density of a diagonal-covariance multivariate Gaussian.
pub fn log_gaussian_pdf(x: ArrayView1<f64>, mean: ArrayView1<f64>, variance: ArrayView1<f64>) -> f64 {
    let mut acc = 0.0;
    for ((&xi, &mu), &var) in x.iter().zip(mean.iter()).zip(variance.iter()) {
        let diff = xi - mu;
        acc += (2.0 * PI * var).ln() + diff * diff / var;
    }
    -0.5 * acc
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation. Zero for fewer than two samples.
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}
