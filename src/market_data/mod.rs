pub mod candle;
pub mod synthetic;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{simple_returns, Candle};
