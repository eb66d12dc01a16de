// =============================================================================
// Regime Risk — Demo Entry Point
// =============================================================================
//
// Trains one regime detector per configured symbol on a synthetic
// two-regime candle series, then logs the risk-adjusted prediction for the
// latest candles of each symbol.
// =============================================================================

use std::collections::HashMap;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regime_risk::market_data::synthetic::{regime_switching_series, RegimeSpec};
use regime_risk::{EngineConfig, Fraction, RegimeRiskEngine};

const DEMO_OBSERVATIONS: usize = 600;
const DEMO_BLOCK: usize = 60;
const DEMO_BASE_SIZE: f64 = 100.0;
const DEMO_DECODE_TAIL: usize = 200;

const DEMO_REGIMES: [RegimeSpec; 2] = [
    RegimeSpec {
        return_mean: 0.004,
        return_std: 0.006,
        volume_std: 0.05,
    },
    RegimeSpec {
        return_mean: -0.006,
        return_std: 0.025,
        volume_std: 0.25,
    },
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Ok(syms) = std::env::var("REGIME_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = EngineConfig::default().symbols;
    }
    info!(symbols = ?config.symbols, n_states = config.hmm.n_states, "Configured symbols");

    // ── 2. Synthetic history per symbol ──────────────────────────────────
    let mut history = HashMap::new();
    for (i, symbol) in config.symbols.iter().enumerate() {
        let series = regime_switching_series(&DEMO_REGIMES, DEMO_OBSERVATIONS, DEMO_BLOCK, 1_000 + i as u64)
            .context("invalid demo regime distribution")?;
        history.insert(symbol.clone(), series.candles);
    }

    // ── 3. Train ─────────────────────────────────────────────────────────
    let engine = RegimeRiskEngine::with_seed(config, 7);
    let reports = engine.retrain_all(history.clone()).await;
    for (symbol, report) in &reports {
        match report {
            Ok(r) => info!(
                symbol = %symbol,
                status = %r.status,
                iterations = r.iterations,
                log_likelihood = ?r.final_log_likelihood(),
                "Training finished"
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "Training failed"),
        }
    }

    // ── 4. Simulated trade flow ──────────────────────────────────────────
    for symbol in engine.symbols() {
        for pnl in [0.012, -0.008, 0.015, 0.004, -0.011, 0.009, 0.02, -0.006, 0.011, -0.013] {
            engine.record_trade(&symbol, Fraction::new(pnl)?, 100.0, 100.0 * (1.0 + pnl), DEMO_BASE_SIZE);
        }
        engine.update_equity(&symbol, engine.config().initial_equity * 1.02);
    }

    // ── 5. Predict ───────────────────────────────────────────────────────
    for symbol in engine.symbols() {
        let Some(candles) = history.get(&symbol) else {
            continue;
        };
        let tail = &candles[candles.len().saturating_sub(DEMO_DECODE_TAIL)..];
        match engine.predict(&symbol, tail, DEMO_BASE_SIZE) {
            Some(p) => {
                info!(
                    symbol = %p.symbol,
                    regime = %p.regime.label,
                    bullish = p.regime.label.is_bullish(),
                    volatile = p.regime.label.is_volatile(),
                    state = p.regime.state,
                    probability = format!("{:.3}", p.regime.probability),
                    window = p.regime.window_used,
                    position_size = format!("{:.2}", p.position_size),
                    kelly = format!("{:.3}", p.kelly_fraction),
                    scaler = format!("{:.3}", p.volatility_scaler),
                    breaker = %p.breaker,
                    can_trade = p.can_trade_today,
                    "Risk-adjusted prediction"
                );
                info!("{}", serde_json::to_string(&p)?);
            }
            None => warn!(symbol = %symbol, "Detector not ready"),
        }
    }

    Ok(())
}
