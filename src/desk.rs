// =============================================================================
// Regime & Risk Engine — per-symbol desks behind one façade
// =============================================================================
//
// Each symbol owns exactly one `SymbolDesk`: a regime detector and a risk
// controller that are never shared with another symbol.  The detector sits
// behind a mutex so training and decoding on one symbol are serialised, while
// different symbols proceed independently.
//
// `predict` composes both halves: the decoded regime (whose window comes from
// the controller's policy table) plus the risk-adjusted position size, Kelly
// fraction, volatility scaler, breaker state and daily gate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::market_data::Candle;
use crate::regime::{Prediction, RegimeDetector, TrainingReport};
use crate::risk::{BreakerState, RiskController};
use crate::runtime_config::EngineConfig;
use crate::types::Fraction;

/// Composite answer of [`RegimeRiskEngine::predict`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAdjustedPrediction {
    pub symbol: String,
    pub regime: Prediction,
    pub base_size: f64,
    pub position_size: f64,
    pub kelly_fraction: f64,
    pub volatility_scaler: f64,
    pub breaker: BreakerState,
    pub can_trade_today: bool,
    /// RFC 3339.
    pub timestamp: String,
}

// =============================================================================
// SymbolDesk
// =============================================================================

/// Detector and risk controller of a single symbol.
pub struct SymbolDesk {
    symbol: String,
    detector: Mutex<RegimeDetector>,
    risk: Arc<RiskController>,
}

impl SymbolDesk {
    fn new(symbol: String, config: &EngineConfig, seed: Option<u64>) -> Self {
        let detector = match seed {
            Some(seed) => RegimeDetector::seeded(config.hmm.clone(), seed),
            None => RegimeDetector::new(config.hmm.clone()),
        };
        let risk = RiskController::new(
            symbol.clone(),
            config.initial_equity,
            config.risk.clone(),
            config.window_policy.clone(),
        );
        Self {
            symbol,
            detector: Mutex::new(detector),
            risk: Arc::new(risk),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn risk(&self) -> &Arc<RiskController> {
        &self.risk
    }

    pub fn is_trained(&self) -> bool {
        self.detector.lock().is_trained()
    }

    /// Train this symbol's detector on `candles`.
    pub fn train(&self, candles: &[Candle]) -> Result<TrainingReport> {
        let mut detector = self.detector.lock();
        let max_iterations = detector.params().max_iterations;
        let report = detector.train_on_candles(candles, max_iterations)?;
        info!(
            symbol = %self.symbol,
            status = %report.status,
            iterations = report.iterations,
            "symbol trained"
        );
        Ok(report)
    }

    /// Decode the current regime and size a `base_size` unit against it.
    pub fn predict(&self, candles: &[Candle], base_size: f64) -> Option<RiskAdjustedPrediction> {
        let regime = {
            let mut detector = self.detector.lock();
            detector.predict_state(candles, &self.symbol, self.risk.as_ref())?
        };

        let equity = self.risk.current_equity();
        Some(RiskAdjustedPrediction {
            symbol: self.symbol.clone(),
            regime,
            base_size,
            position_size: self.risk.calculate_position_size(base_size, equity),
            kelly_fraction: self.risk.kelly_fraction(),
            volatility_scaler: self.risk.volatility_scaler(),
            breaker: self.risk.breaker_state(),
            can_trade_today: self.risk.can_trade_today_accumulated(),
            timestamp: Utc::now().to_rfc3339(),
        })
    }
}

impl std::fmt::Debug for SymbolDesk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolDesk")
            .field("symbol", &self.symbol)
            .field("risk", &self.risk)
            .finish()
    }
}

// =============================================================================
// RegimeRiskEngine
// =============================================================================

/// Routes calls to per-symbol desks, creating them on first use.
pub struct RegimeRiskEngine {
    config: EngineConfig,
    seed: Option<u64>,
    desks: RwLock<HashMap<String, Arc<SymbolDesk>>>,
}

impl RegimeRiskEngine {
    /// Engine with entropy-seeded detectors for every configured symbol.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine whose detectors are reproducibly seeded from `seed`.
    pub fn with_seed(config: EngineConfig, seed: u64) -> Self {
        Self::build(config, Some(seed))
    }

    fn build(config: EngineConfig, seed: Option<u64>) -> Self {
        let engine = Self {
            config,
            seed,
            desks: RwLock::new(HashMap::new()),
        };
        for symbol in engine.config.symbols.clone() {
            engine.desk(&symbol);
        }
        info!(symbols = ?engine.symbols(), "regime risk engine initialised");
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Desk for `symbol`, created on first access.
    pub fn desk(&self, symbol: &str) -> Arc<SymbolDesk> {
        let key = symbol.to_ascii_uppercase();
        if let Some(desk) = self.desks.read().get(&key) {
            return Arc::clone(desk);
        }
        let mut desks = self.desks.write();
        Arc::clone(desks.entry(key.clone()).or_insert_with(|| {
            let seed = self.seed.map(|s| symbol_seed(s, &key));
            Arc::new(SymbolDesk::new(key, &self.config, seed))
        }))
    }

    /// Sorted list of symbols with a desk.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.desks.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn train_symbol(&self, symbol: &str, candles: &[Candle]) -> Result<TrainingReport> {
        self.desk(symbol).train(candles)
    }

    pub fn predict(&self, symbol: &str, candles: &[Candle], base_size: f64) -> Option<RiskAdjustedPrediction> {
        self.desk(symbol).predict(candles, base_size)
    }

    /// Record a completed trade of `notional` account currency. A loss adds
    /// `|pnl| × notional` to the daily accumulator.
    pub fn record_trade(&self, symbol: &str, pnl: Fraction, entry_price: f64, exit_price: f64, notional: f64) {
        let desk = self.desk(symbol);
        let risk = desk.risk();
        risk.record_trade(pnl, entry_price, exit_price, desk.symbol());
        if pnl.value() < 0.0 && notional.is_finite() && notional > 0.0 {
            risk.accumulate_daily_loss(-pnl.value() * notional);
        }
    }

    /// Feed the symbol's latest equity; returns whether its breaker is active.
    pub fn update_equity(&self, symbol: &str, equity: f64) -> bool {
        self.desk(symbol).risk().update_drawdown(equity)
    }

    /// Day rollover for every desk.
    pub fn reset_daily(&self) {
        for desk in self.desks.read().values() {
            desk.risk().reset_daily();
        }
    }

    /// Retrain every symbol in `batches` on the blocking pool, one task per
    /// symbol. Symbols whose task panics are logged and left out.
    pub async fn retrain_all(&self, batches: HashMap<String, Vec<Candle>>) -> HashMap<String, Result<TrainingReport>> {
        let mut handles = Vec::with_capacity(batches.len());
        for (symbol, candles) in batches {
            let desk = self.desk(&symbol);
            let handle = tokio::task::spawn_blocking(move || desk.train(&candles));
            handles.push((symbol.to_ascii_uppercase(), handle));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for (symbol, handle) in handles {
            match handle.await {
                Ok(result) => {
                    results.insert(symbol, result);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "retrain task failed"),
            }
        }
        results
    }
}

impl std::fmt::Debug for RegimeRiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeRiskEngine")
            .field("symbols", &self.symbols())
            .field("seeded", &self.seed.is_some())
            .finish()
    }
}

/// Stable per-symbol seed (FNV-1a over the symbol, mixed with `base`).
fn symbol_seed(base: u64, symbol: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in symbol.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^ base
}
