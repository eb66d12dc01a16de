use serde::{Deserialize, Serialize};

/// A single OHLCV candle as delivered by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds since the Unix epoch.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build a candle where only the close and volume matter (open/high/low
    /// collapse onto the close).
    pub fn from_close(open_time: i64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }
}

/// Simple (arithmetic) returns `close_t / close_{t-1} - 1` over the slice.
///
/// Pairs with a non-positive previous close are skipped.
pub fn simple_returns(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect()
}
