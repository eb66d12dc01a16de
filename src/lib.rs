// =============================================================================
// Regime Risk — HMM market-regime detection coupled with adaptive risk sizing
// =============================================================================

pub mod desk;
pub mod error;
pub mod market_data;
pub mod regime;
pub mod risk;
pub mod runtime_config;
pub mod types;

pub use desk::{RegimeRiskEngine, RiskAdjustedPrediction, SymbolDesk};
pub use error::{RegimeError, Result};
pub use regime::{Prediction, RegimeDetector, StateLabel, WindowSizePolicy};
pub use risk::{BreakerState, RiskController, RiskSnapshot};
pub use runtime_config::EngineConfig;
pub use types::{Fraction, TradeOutcome};
