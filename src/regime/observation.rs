// =============================================================================
// Observation Builder — candles → [log price return, log volume return]
// =============================================================================
//
//   o_t = [ ln(close_t / close_{t-1}),  ln(v'_t / v'_{t-1}) ]
//
// v' is the volume, with zero or negative volume floored to 1 so the log
// stays finite.  A non-positive close is rejected as malformed input instead
// of being allowed to turn into NaN.
// =============================================================================

use ndarray::Array2;

use crate::error::{RegimeError, Result};
use crate::market_data::Candle;

/// Dimensionality of one observation vector.
pub const OBS_DIM: usize = 2;

fn floored_volume(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        1.0
    }
}

/// Build the `(len - 1) x OBS_DIM` observation matrix for a candle window.
pub fn build_observations(candles: &[Candle]) -> Result<Array2<f64>> {
    if candles.len() < 2 {
        return Err(RegimeError::InsufficientData {
            needed: 2,
            got: candles.len(),
        });
    }

    if let Some((index, c)) = candles
        .iter()
        .enumerate()
        .find(|(_, c)| !(c.close.is_finite() && c.close > 0.0))
    {
        return Err(RegimeError::MalformedCandle {
            index,
            close: c.close,
        });
    }

    let mut obs = Array2::zeros((candles.len() - 1, OBS_DIM));
    for (t, pair) in candles.windows(2).enumerate() {
        obs[[t, 0]] = (pair[1].close / pair[0].close).ln();
        obs[[t, 1]] = (floored_volume(pair[1].volume) / floored_volume(pair[0].volume)).ln();
    }
    Ok(obs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_window() {
        let one = [Candle::from_close(0, 100.0, 10.0)];
        assert_eq!(
            build_observations(&one),
            Err(RegimeError::InsufficientData { needed: 2, got: 1 })
        );
        assert!(build_observations(&[]).is_err());
    }

    #[test]
    fn rejects_non_positive_close() {
        let candles = [
            Candle::from_close(0, 100.0, 10.0),
            Candle::from_close(1, 0.0, 10.0),
        ];
        assert_eq!(
            build_observations(&candles),
            Err(RegimeError::MalformedCandle { index: 1, close: 0.0 })
        );
    }

    #[test]
    fn log_returns_and_volume_floor() {
        let candles = [
            Candle::from_close(0, 100.0, 0.0),
            Candle::from_close(1, 110.0, 50.0),
            Candle::from_close(2, 99.0, 50.0),
        ];
        let obs = build_observations(&candles).unwrap();
        assert_eq!(obs.dim(), (2, OBS_DIM));
        assert!((obs[[0, 0]] - (1.1_f64).ln()).abs() < 1e-12);
        // zero volume floored to 1
        assert!((obs[[0, 1]] - 50.0_f64.ln()).abs() < 1e-12);
        assert!((obs[[1, 0]] - (0.9_f64).ln()).abs() < 1e-12);
        assert!(obs[[1, 1]].abs() < 1e-12);
        assert!(obs.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn fractional_volume_is_kept() {
        let candles = [
            Candle::from_close(0, 100.0, 0.3),
            Candle::from_close(1, 100.0, 0.9),
            Candle::from_close(2, 100.0, -2.0),
        ];
        let obs = build_observations(&candles).unwrap();
        assert!((obs[[0, 1]] - 3.0_f64.ln()).abs() < 1e-12);
        // negative volume floored to 1
        assert!((obs[[1, 1]] - (1.0_f64 / 0.9).ln()).abs() < 1e-12);
    }
}
