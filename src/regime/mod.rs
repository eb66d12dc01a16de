// =============================================================================
// Regime Detection Module
// =============================================================================
//
// Hidden Markov Model regime detection over candle-derived observations:
// - observation: candles → [log price return, log volume return]
// - model:       Gaussian HMM parameters in log space + state labels
// - trainer:     Baum-Welch (EM) with log-sum-exp forward/backward passes
// - decoder:     Viterbi max-product decoding
// - detector:    per-symbol owner of the above, with an adaptive window

pub mod decoder;
pub mod detector;
pub mod math;
pub mod model;
pub mod observation;
pub mod trainer;

pub use detector::{recent_volatility, FixedWindow, Prediction, RegimeDetector, WindowSizePolicy};
pub use model::{ModelParams, RegimeModel, StateLabel};
pub use observation::{build_observations, OBS_DIM};
pub use trainer::{TrainingReport, TrainingStatus};
