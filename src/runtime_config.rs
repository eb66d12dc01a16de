// =============================================================================
// Engine Configuration — HMM, risk and window-policy settings with atomic save
// =============================================================================
//
// Every tunable constant of the regime detector and the risk controller lives
// here.  All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_initial_equity() -> f64 {
    10_000.0
}

fn default_n_states() -> usize {
    8
}

fn default_max_iterations() -> usize {
    100
}

fn default_min_train_observations() -> usize {
    100
}

fn default_convergence_tolerance() -> f64 {
    0.1
}

fn default_variance_floor() -> f64 {
    1e-9
}

fn default_self_transition() -> f64 {
    0.95
}

fn default_volatility_lookback() -> usize {
    50
}

fn default_lateral_band() -> f64 {
    0.0005
}

fn default_volatile_std() -> f64 {
    0.015
}

fn default_kelly_multiplier() -> f64 {
    0.5
}

fn default_min_kelly() -> f64 {
    0.1
}

fn default_max_kelly() -> f64 {
    1.0
}

fn default_min_trades_for_kelly() -> usize {
    10
}

fn default_trade_history_capacity() -> usize {
    100
}

fn default_return_buffer_capacity() -> usize {
    20
}

fn default_max_drawdown() -> f64 {
    0.20
}

fn default_breaker_reset_ratio() -> f64 {
    0.75
}

fn default_breaker_size_multiplier() -> f64 {
    0.5
}

fn default_volatility_threshold() -> f64 {
    0.03
}

fn default_volatility_slope() -> f64 {
    5.0
}

fn default_min_volatility_scaler() -> f64 {
    0.3
}

fn default_max_daily_loss() -> f64 {
    0.03
}

fn default_min_size_fraction() -> f64 {
    0.1
}

fn default_high_volatility_symbols() -> Vec<String> {
    vec!["SOLUSDT".to_string()]
}

fn default_window_buckets() -> Vec<WindowBucket> {
    vec![
        WindowBucket {
            min_volatility: 0.04,
            window: 150,
        },
        WindowBucket {
            min_volatility: 0.03,
            window: 125,
        },
    ]
}

fn default_window() -> usize {
    100
}

// =============================================================================
// HmmParams
// =============================================================================

/// Settings for the Baum-Welch trainer, the Viterbi decoder and state labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmParams {
    /// Number of hidden states.
    #[serde(default = "default_n_states")]
    pub n_states: usize,

    /// Iteration cap used when the caller does not pass one.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Below this many observations `train` is a no-op.
    #[serde(default = "default_min_train_observations")]
    pub min_train_observations: usize,

    /// Absolute log-likelihood change that counts as converged.
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,

    /// Lower bound for every per-state variance entry.
    #[serde(default = "default_variance_floor")]
    pub variance_floor: f64,

    /// Initial self-transition probability.
    #[serde(default = "default_self_transition")]
    pub self_transition: f64,

    /// Number of trailing candles used to measure decode-time volatility.
    #[serde(default = "default_volatility_lookback")]
    pub volatility_lookback: usize,

    /// |mean return| below this labels a state as lateral.
    #[serde(default = "default_lateral_band")]
    pub lateral_band: f64,

    /// Return standard deviation above this labels a state as volatile.
    #[serde(default = "default_volatile_std")]
    pub volatile_std: f64,
}

impl Default for HmmParams {
    fn default() -> Self {
        Self {
            n_states: default_n_states(),
            max_iterations: default_max_iterations(),
            min_train_observations: default_min_train_observations(),
            convergence_tolerance: default_convergence_tolerance(),
            variance_floor: default_variance_floor(),
            self_transition: default_self_transition(),
            volatility_lookback: default_volatility_lookback(),
            lateral_band: default_lateral_band(),
            volatile_std: default_volatile_std(),
        }
    }
}

// =============================================================================
// RiskParams
// =============================================================================

/// Limits and shape constants for the adaptive risk controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Multiplier applied to the optimal Kelly fraction (0.5 == half Kelly).
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_multiplier: f64,

    #[serde(default = "default_min_kelly")]
    pub min_kelly: f64,

    #[serde(default = "default_max_kelly")]
    pub max_kelly: f64,

    /// Trades required before Kelly throttles anything.
    #[serde(default = "default_min_trades_for_kelly")]
    pub min_trades_for_kelly: usize,

    #[serde(default = "default_trade_history_capacity")]
    pub trade_history_capacity: usize,

    #[serde(default = "default_return_buffer_capacity")]
    pub return_buffer_capacity: usize,

    /// Drawdown fraction that trips the circuit breaker (0.20 == 20 %).
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    /// The breaker resets below `max_drawdown * breaker_reset_ratio`.
    #[serde(default = "default_breaker_reset_ratio")]
    pub breaker_reset_ratio: f64,

    /// Sizing multiplier while the breaker is tripped.
    #[serde(default = "default_breaker_size_multiplier")]
    pub breaker_size_multiplier: f64,

    /// Sample standard deviation above which sizing is scaled down.
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,

    /// Linear scale-down slope per unit of excess volatility.
    #[serde(default = "default_volatility_slope")]
    pub volatility_slope: f64,

    #[serde(default = "default_min_volatility_scaler")]
    pub min_volatility_scaler: f64,

    /// Maximum daily loss as a fraction of current equity (0.03 == 3 %).
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Position size never drops below this fraction of the base size.
    #[serde(default = "default_min_size_fraction")]
    pub min_size_fraction: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            kelly_multiplier: default_kelly_multiplier(),
            min_kelly: default_min_kelly(),
            max_kelly: default_max_kelly(),
            min_trades_for_kelly: default_min_trades_for_kelly(),
            trade_history_capacity: default_trade_history_capacity(),
            return_buffer_capacity: default_return_buffer_capacity(),
            max_drawdown: default_max_drawdown(),
            breaker_reset_ratio: default_breaker_reset_ratio(),
            breaker_size_multiplier: default_breaker_size_multiplier(),
            volatility_threshold: default_volatility_threshold(),
            volatility_slope: default_volatility_slope(),
            min_volatility_scaler: default_min_volatility_scaler(),
            max_daily_loss: default_max_daily_loss(),
            min_size_fraction: default_min_size_fraction(),
        }
    }
}

// =============================================================================
// WindowPolicy
// =============================================================================

/// One row of the volatility → window lookup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowBucket {
    /// Strictly-greater-than threshold on the measured volatility.
    pub min_volatility: f64,
    pub window: usize,
}

/// Policy table for the decoder's lookback window.
///
/// This is a fixed lookup, not something the EM fit learns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Symbols that get the volatility-bucketed windows.
    #[serde(default = "default_high_volatility_symbols")]
    pub high_volatility_symbols: Vec<String>,

    /// Buckets checked in order; first match wins.
    #[serde(default = "default_window_buckets")]
    pub buckets: Vec<WindowBucket>,

    /// Window for everything else.
    #[serde(default = "default_window")]
    pub default_window: usize,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            high_volatility_symbols: default_high_volatility_symbols(),
            buckets: default_window_buckets(),
            default_window: default_window(),
        }
    }
}

impl WindowPolicy {
    pub fn lookup(&self, symbol: &str, volatility: f64) -> usize {
        if !self
            .high_volatility_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol))
        {
            return self.default_window;
        }
        self.buckets
            .iter()
            .find(|b| volatility > b.min_volatility)
            .map(|b| b.window)
            .unwrap_or(self.default_window)
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the engine builds desks for.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Starting equity of every symbol's risk controller.
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,

    #[serde(default)]
    pub hmm: HmmParams,

    #[serde(default)]
    pub risk: RiskParams,

    #[serde(default)]
    pub window_policy: WindowPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            initial_equity: default_initial_equity(),
            hmm: HmmParams::default(),
            risk: RiskParams::default(),
            window_policy: WindowPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            n_states = config.hmm.n_states,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
