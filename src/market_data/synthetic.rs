// =============================================================================
// Synthetic candle series — seeded regime-switching random walk
// =============================================================================
//
// Used by the demo binary and the tests to produce candle windows with a
// known ("planted") regime at every step.  Regimes alternate in fixed-length
// blocks; each block draws its log price return and log volume change from
// the regime's own Gaussians.
// =============================================================================

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{RegimeError, Result};
use crate::market_data::Candle;

/// Return and volume-change distribution of one planted regime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeSpec {
    pub return_mean: f64,
    pub return_std: f64,
    pub volume_std: f64,
}

/// Candles plus the regime index that generated each observation.
#[derive(Debug, Clone)]
pub struct SyntheticSeries {
    pub candles: Vec<Candle>,
    /// `planted[t]` is the regime of observation `t` (between candle `t` and
    /// `t + 1`).
    pub planted: Vec<usize>,
}

/// Generate `observations + 1` candles cycling through `regimes` every
/// `block` observations, starting at regime 0.
///
/// Every regime needs a finite mean and strictly positive, finite standard
/// deviations.
pub fn regime_switching_series(
    regimes: &[RegimeSpec],
    observations: usize,
    block: usize,
    seed: u64,
) -> Result<SyntheticSeries> {
    let mut rng = StdRng::seed_from_u64(seed);
    let block = block.max(1);

    let dists = regimes
        .iter()
        .enumerate()
        .map(|(index, r)| -> Result<(Normal<f64>, Normal<f64>)> {
            let invalid = || RegimeError::InvalidRegimeSpec {
                index,
                return_mean: r.return_mean,
                return_std: r.return_std,
                volume_std: r.volume_std,
            };
            let positive = |s: f64| s.is_finite() && s > 0.0;
            if !r.return_mean.is_finite() || !positive(r.return_std) || !positive(r.volume_std) {
                return Err(invalid());
            }
            let ret = Normal::new(r.return_mean, r.return_std).map_err(|_| invalid())?;
            let vol = Normal::new(0.0, r.volume_std).map_err(|_| invalid())?;
            Ok((ret, vol))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut candles = Vec::with_capacity(observations + 1);
    let mut planted = Vec::with_capacity(observations);
    let mut close = 100.0_f64;
    let mut volume = 1_000.0_f64;
    candles.push(Candle::from_close(0, close, volume));

    if dists.is_empty() {
        return Ok(SyntheticSeries { candles, planted });
    }

    for t in 0..observations {
        let regime = (t / block) % dists.len();
        let (ret, vol) = &dists[regime];
        close *= ret.sample(&mut rng).exp();
        volume *= vol.sample(&mut rng).exp();
        candles.push(Candle::from_close((t as i64 + 1) * 60_000, close, volume));
        planted.push(regime);
    }

    Ok(SyntheticSeries { candles, planted })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALM: RegimeSpec = RegimeSpec {
        return_mean: 0.01,
        return_std: 0.002,
        volume_std: 0.05,
    };
    const WILD: RegimeSpec = RegimeSpec {
        return_mean: -0.01,
        return_std: 0.03,
        volume_std: 0.2,
    };

    #[test]
    fn blocks_alternate() {
        let s = regime_switching_series(&[CALM, WILD], 200, 50, 1).unwrap();
        assert_eq!(s.candles.len(), 201);
        assert_eq!(s.planted.len(), 200);
        assert_eq!(s.planted[0], 0);
        assert_eq!(s.planted[50], 1);
        assert_eq!(s.planted[199], 1);
        assert!(s.candles.iter().all(|c| c.close > 0.0 && c.volume > 0.0));
    }

    #[test]
    fn seeded_series_is_reproducible() {
        let a = regime_switching_series(&[CALM, WILD], 100, 10, 9).unwrap();
        let b = regime_switching_series(&[CALM, WILD], 100, 10, 9).unwrap();
        assert_eq!(a.candles, b.candles);
    }

    #[test]
    fn negative_std_is_rejected() {
        let bad = RegimeSpec {
            return_std: -1.0,
            ..CALM
        };
        assert!(matches!(
            regime_switching_series(&[CALM, bad], 10, 5, 0),
            Err(RegimeError::InvalidRegimeSpec { index: 1, .. })
        ));
    }

    #[test]
    fn degenerate_distributions_are_rejected() {
        let specs = [
            RegimeSpec { return_std: 0.0, ..CALM },
            RegimeSpec { volume_std: -0.1, ..CALM },
            RegimeSpec { return_std: f64::NAN, ..CALM },
            RegimeSpec { return_mean: f64::INFINITY, ..CALM },
        ];
        for bad in specs {
            assert!(regime_switching_series(&[bad], 10, 5, 0).is_err());
        }
    }
}
