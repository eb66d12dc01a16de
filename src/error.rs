// =============================================================================
// Error types for the regime & risk core
// =============================================================================
//
// Only genuinely malformed input surfaces as an error.  "Not ready" conditions
// (too few candles, untrained model) are modelled as `None` or as a
// `TrainingStatus` so the caller's loop is never interrupted.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegimeError {
    /// Fewer samples than the operation requires.
    #[error("insufficient data: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// A candle whose close is zero, negative or non-finite.
    #[error("malformed candle at index {index}: close = {close}")]
    MalformedCandle { index: usize, close: f64 },

    /// Observation dimensionality does not match the trained model.
    #[error("observation dimension mismatch: model expects {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Raw model parameters that violate the model invariants.
    #[error("invalid model parameters: {0}")]
    InvalidParams(String),

    /// A synthetic regime whose distribution cannot be sampled.
    #[error("invalid regime spec {index}: mean = {return_mean}, return std = {return_std}, volume std = {volume_std}")]
    InvalidRegimeSpec {
        index: usize,
        return_mean: f64,
        return_std: f64,
        volume_std: f64,
    },

    /// A PnL value that cannot be a fraction of position value.
    #[error("invalid fraction: {0}")]
    InvalidFraction(f64),
}

pub type Result<T> = std::result::Result<T, RegimeError>;
