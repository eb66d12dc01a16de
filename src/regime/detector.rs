// =============================================================================
// Market Regime Detector — Gaussian HMM over [price return, volume return]
// =============================================================================
//
// Owns one symbol's `RegimeModel` together with the trainer and decoder
// workspaces.  Training is a discrete batch call; prediction decodes a
// volatility-sized window of the most recent candles.
//
// Prediction flow:
//
//   1. volatility = population stdev of simple returns, last <= 50 candles
//   2. window     = policy.window_size(symbol, volatility)
//   3. policy.observe_volatility(volatility)   (feeds the risk scaler)
//   4. observations of the last `window` candles → Viterbi → terminal state
//
// The detector is not `Sync`-shared for writes: `train` and `predict_state`
// take `&mut self`, so the caller serialises access per symbol.
// =============================================================================

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegimeError, Result};
use crate::market_data::{simple_returns, Candle};
use crate::regime::decoder::Viterbi;
use crate::regime::math::population_std;
use crate::regime::model::{RegimeModel, StateLabel};
use crate::regime::observation::{build_observations, OBS_DIM};
use crate::regime::trainer::{BaumWelch, TrainingReport};
use crate::runtime_config::HmmParams;

// =============================================================================
// Types
// =============================================================================

/// Supplies the decoder's lookback window and receives its volatility reading.
pub trait WindowSizePolicy {
    /// Number of trailing candles to decode for `symbol` at `volatility`.
    fn window_size(&self, symbol: &str, volatility: f64) -> usize;

    /// Called with every volatility measured at prediction time.
    fn observe_volatility(&self, _volatility: f64) {}
}

/// A fixed window, ignoring volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow(pub usize);

impl WindowSizePolicy for FixedWindow {
    fn window_size(&self, _symbol: &str, _volatility: f64) -> usize {
        self.0
    }
}

/// Decoded regime for the most recent candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Index of the most probable terminal hidden state.
    pub state: usize,
    /// Terminal state's normalised best-path probability, in (0, 1].
    pub probability: f64,
    pub label: StateLabel,
    /// Volatility measured over the trailing candles.
    pub volatility: f64,
    /// Number of candles actually decoded.
    pub window_used: usize,
}

/// Population standard deviation of simple returns over the last
/// `lookback` candles.
pub fn recent_volatility(candles: &[Candle], lookback: usize) -> f64 {
    let start = candles.len().saturating_sub(lookback);
    population_std(&simple_returns(&candles[start..]))
}

// =============================================================================
// RegimeDetector
// =============================================================================

pub struct RegimeDetector<R: RngCore = StdRng> {
    params: HmmParams,
    model: Option<RegimeModel>,
    trainer: BaumWelch,
    decoder: Viterbi,
    rng: R,
    last_report: Option<TrainingReport>,
}

impl RegimeDetector<StdRng> {
    /// Detector with an entropy-seeded random source.
    pub fn new(params: HmmParams) -> Self {
        Self::with_rng(params, StdRng::from_entropy())
    }

    /// Detector whose state initialisation is reproducible.
    pub fn seeded(params: HmmParams, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }
}

impl<R: RngCore> RegimeDetector<R> {
    pub fn with_rng(params: HmmParams, rng: R) -> Self {
        Self {
            params,
            model: None,
            trainer: BaumWelch::new(),
            decoder: Viterbi::new(),
            rng,
            last_report: None,
        }
    }

    pub fn params(&self) -> &HmmParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&RegimeModel> {
        self.model.as_ref()
    }

    pub fn last_report(&self) -> Option<&TrainingReport> {
        self.last_report.as_ref()
    }

    /// Install an externally restored model, replacing any fitted one.
    pub fn load_model(&mut self, model: RegimeModel) {
        self.model = Some(model);
    }

    /// Fit the model on `observations` (rows = time, cols = features).
    ///
    /// Below `min_train_observations` rows this is a no-op returning a
    /// `Skipped` report. The first successful call seeds the model from the
    /// injected random source; later calls refine it in place.
    pub fn train(&mut self, observations: ArrayView2<f64>, max_iterations: usize) -> Result<TrainingReport> {
        let rows = observations.nrows();
        if rows < self.params.min_train_observations {
            debug!(
                observations = rows,
                required = self.params.min_train_observations,
                "not enough observations to train, skipping"
            );
            return Ok(TrainingReport::skipped());
        }

        let report = match self.model.as_mut() {
            Some(model) => {
                if observations.ncols() != model.n_dims() {
                    return Err(RegimeError::DimensionMismatch {
                        expected: model.n_dims(),
                        got: observations.ncols(),
                    });
                }
                self.trainer.fit(model, observations, max_iterations, &self.params)
            }
            None => {
                if observations.ncols() != OBS_DIM {
                    return Err(RegimeError::DimensionMismatch {
                        expected: OBS_DIM,
                        got: observations.ncols(),
                    });
                }
                let mut fresh = RegimeModel::initialize(observations, &self.params, &mut self.rng);
                let report = self.trainer.fit(&mut fresh, observations, max_iterations, &self.params);
                if report.iterations > 0 {
                    self.model = Some(fresh);
                }
                report
            }
        };

        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Build observations from `candles` and train on them.
    pub fn train_on_candles(&mut self, candles: &[Candle], max_iterations: usize) -> Result<TrainingReport> {
        let observations = build_observations(candles)?;
        self.train(observations.view(), max_iterations)
    }

    /// Decode the regime of the most recent candle.
    ///
    /// `None` when the model is untrained, fewer than two candles are given,
    /// or the sliced window holds fewer than two candles.
    pub fn predict_state(
        &mut self,
        candles: &[Candle],
        symbol: &str,
        policy: &dyn WindowSizePolicy,
    ) -> Option<Prediction> {
        if candles.len() < 2 {
            return None;
        }
        let model = self.model.as_ref()?;

        let volatility = recent_volatility(candles, self.params.volatility_lookback);
        let window = policy.window_size(symbol, volatility);
        policy.observe_volatility(volatility);

        let window_candles = &candles[candles.len().saturating_sub(window)..];
        let observations = match build_observations(window_candles) {
            Ok(obs) => obs,
            Err(e) => {
                debug!(symbol, window, error = %e, "regime prediction not ready");
                return None;
            }
        };
        if observations.ncols() != model.n_dims() {
            return None;
        }

        let outcome = self.decoder.decode(model, observations.view())?;
        let label = model.label(outcome.terminal_state);

        debug!(
            symbol,
            state = outcome.terminal_state,
            label = %label,
            probability = format!("{:.4}", outcome.probability),
            volatility = format!("{:.5}", volatility),
            window = window_candles.len(),
            "regime decoded"
        );

        Some(Prediction {
            state: outcome.terminal_state,
            probability: outcome.probability,
            label,
            volatility,
            window_used: window_candles.len(),
        })
    }

    /// Most probable state at every step of `observations`.
    pub fn decode_path(&mut self, observations: ArrayView2<f64>) -> Option<Vec<usize>> {
        let model = self.model.as_ref()?;
        if observations.ncols() != model.n_dims() {
            return None;
        }
        let outcome = self.decoder.decode(model, observations)?;
        Some(self.decoder.path(outcome.terminal_state))
    }
}

impl<R: RngCore> std::fmt::Debug for RegimeDetector<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeDetector")
            .field("n_states", &self.params.n_states)
            .field("trained", &self.model.is_some())
            .field("last_status", &self.last_report.as_ref().map(|r| r.status))
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::synthetic::{regime_switching_series, RegimeSpec};
    use crate::regime::trainer::TrainingStatus;
    use parking_lot::Mutex;

    const CALM_BULL: RegimeSpec = RegimeSpec {
        return_mean: 0.01,
        return_std: 0.005,
        volume_std: 0.05,
    };
    const WILD_BEAR: RegimeSpec = RegimeSpec {
        return_mean: -0.01,
        return_std: 0.03,
        volume_std: 0.2,
    };

    /// Records every volatility the detector reports.
    struct RecordingPolicy {
        window: usize,
        seen: Mutex<Vec<f64>>,
    }

    impl WindowSizePolicy for RecordingPolicy {
        fn window_size(&self, _symbol: &str, _volatility: f64) -> usize {
            self.window
        }

        fn observe_volatility(&self, volatility: f64) {
            self.seen.lock().push(volatility);
        }
    }

    fn hmm(n: usize) -> HmmParams {
        HmmParams {
            n_states: n,
            ..HmmParams::default()
        }
    }

    fn trained(n: usize, seed: u64) -> (RegimeDetector, Vec<Candle>) {
        let series = regime_switching_series(&[CALM_BULL, WILD_BEAR], 600, 50, seed).unwrap();
        let mut det = RegimeDetector::seeded(hmm(n), seed);
        det.train_on_candles(&series.candles, 200).unwrap();
        (det, series.candles)
    }

    #[test]
    fn untrained_detector_predicts_nothing() {
        let series = regime_switching_series(&[CALM_BULL], 30, 50, 1).unwrap();
        let mut det = RegimeDetector::seeded(hmm(2), 1);
        assert!(!det.is_trained());
        assert!(det.predict_state(&series.candles, "BTCUSDT", &FixedWindow(100)).is_none());
    }

    #[test]
    fn short_sequence_is_a_noop() {
        let series = regime_switching_series(&[CALM_BULL], 99, 50, 1).unwrap();
        let mut det = RegimeDetector::seeded(hmm(2), 1);
        let report = det.train_on_candles(&series.candles, 50).unwrap();
        assert_eq!(report.status, TrainingStatus::Skipped);
        assert!(!det.is_trained());
    }

    #[test]
    fn fewer_than_two_candles_is_none() {
        let (mut det, candles) = trained(2, 3);
        assert!(det.predict_state(&candles[..1], "BTCUSDT", &FixedWindow(100)).is_none());
        assert!(det.predict_state(&[], "BTCUSDT", &FixedWindow(100)).is_none());
    }

    #[test]
    fn window_of_one_candle_is_none() {
        let (mut det, candles) = trained(2, 3);
        assert!(det.predict_state(&candles, "BTCUSDT", &FixedWindow(1)).is_none());
        assert!(det.predict_state(&candles, "BTCUSDT", &FixedWindow(0)).is_none());
    }

    #[test]
    fn window_is_sliced_from_the_policy() {
        let (mut det, candles) = trained(2, 3);
        let p = det.predict_state(&candles, "BTCUSDT", &FixedWindow(40)).unwrap();
        assert_eq!(p.window_used, 40);
        let p = det.predict_state(&candles[..10], "BTCUSDT", &FixedWindow(40)).unwrap();
        assert_eq!(p.window_used, 10);
    }

    #[test]
    fn volatility_is_fed_back_to_the_policy() {
        let (mut det, candles) = trained(2, 3);
        let policy = RecordingPolicy {
            window: 60,
            seen: Mutex::new(Vec::new()),
        };
        let p = det.predict_state(&candles, "SOLUSDT", &policy).unwrap();
        let seen = policy.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], p.volatility);
        assert!((p.volatility - recent_volatility(&candles, 50)).abs() < 1e-15);
    }

    #[test]
    fn recovers_planted_regimes() {
        let series = regime_switching_series(&[CALM_BULL, WILD_BEAR], 600, 50, 17).unwrap();
        let mut det = RegimeDetector::seeded(hmm(2), 17);
        let report = det.train_on_candles(&series.candles, 300).unwrap();
        assert_ne!(report.status, TrainingStatus::Diverged);

        let obs = build_observations(&series.candles).unwrap();
        let path = det.decode_path(obs.view()).unwrap();
        let model = det.model().unwrap();

        let hits = path
            .iter()
            .zip(&series.planted)
            .filter(|&(&state, &planted)| {
                let label = model.label(state);
                match planted {
                    0 => label == StateLabel::BullishStable,
                    _ => label == StateLabel::BearishVolatile,
                }
            })
            .count();
        let accuracy = hits as f64 / path.len() as f64;
        assert!(accuracy >= 0.90, "accuracy {accuracy:.3}");
    }

    #[test]
    fn prediction_is_deterministic() {
        let (mut det, candles) = trained(3, 5);
        let a = det.predict_state(&candles, "BTCUSDT", &FixedWindow(100)).unwrap();
        let b = det.predict_state(&candles, "BTCUSDT", &FixedWindow(100)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.probability.to_bits(), b.probability.to_bits());
    }

    #[test]
    fn restored_model_predicts_identically() {
        let (mut det, candles) = trained(3, 5);
        let original = det.predict_state(&candles, "BTCUSDT", &FixedWindow(100)).unwrap();

        let json = serde_json::to_string(&det.model().unwrap().to_params()).unwrap();
        let raw = serde_json::from_str(&json).unwrap();
        let restored = RegimeModel::from_params(&raw, det.params()).unwrap();

        let mut fresh = RegimeDetector::seeded(hmm(3), 999);
        fresh.load_model(restored);
        let copy = fresh.predict_state(&candles, "BTCUSDT", &FixedWindow(100)).unwrap();
        assert_eq!(original, copy);
    }

    #[test]
    fn retraining_refines_in_place() {
        let (mut det, candles) = trained(2, 8);
        let report = det.train_on_candles(&candles, 50).unwrap();
        assert!(det.is_trained());
        assert!(report.iterations >= 1);
        assert_eq!(det.model().unwrap().n_states(), 2);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let (mut det, _) = trained(2, 8);
        let obs = ndarray::Array2::<f64>::zeros((150, 3));
        assert_eq!(
            det.train(obs.view(), 10),
            Err(RegimeError::DimensionMismatch { expected: 2, got: 3 })
        );
    }

    #[test]
    fn first_fit_checks_observation_width() {
        let mut det = RegimeDetector::seeded(hmm(2), 4);
        for cols in [0, 1, 3] {
            let obs = ndarray::Array2::<f64>::zeros((150, cols));
            assert_eq!(
                det.train(obs.view(), 5),
                Err(RegimeError::DimensionMismatch {
                    expected: OBS_DIM,
                    got: cols
                })
            );
        }
        assert!(!det.is_trained());
    }

    #[test]
    fn probability_in_unit_interval() {
        let (mut det, candles) = trained(4, 12);
        for end in [30, 120, 350, candles.len()] {
            let p = det.predict_state(&candles[..end], "BTCUSDT", &FixedWindow(100)).unwrap();
            assert!(p.probability > 0.0 && p.probability <= 1.0);
            assert!(p.state < 4);
        }
    }
}
