// =============================================================================
// Adaptive Risk Controller — per-symbol sizing policies
// =============================================================================
//
// Policies, all operating on one symbol's state:
//   1. Kelly fraction:      fractional Kelly from the rolling trade history
//                           (last 100 trades), clamped to [0.1, 1.0].
//   2. Circuit breaker:     NORMAL → TRIPPED when drawdown > 20 %;
//                           TRIPPED → NORMAL only when drawdown < 15 %.
//                           Sizing is halved while tripped.
//   3. Volatility scaler:   stdev of the last 20 return samples; above 3 %
//                           sizing scales down linearly, never below 0.3.
//   4. Daily loss gate:     no new trades once today's loss reaches 3 % of
//                           current equity.  The caller resets the day.
//   5. HMM window policy:   volatility-bucketed decode window per symbol.
//
// Position size = base × kelly × scaler × (0.5 if tripped), floored at
// 0.1 × base.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::regime::math::population_std;
use crate::regime::WindowSizePolicy;
use crate::runtime_config::{RiskParams, WindowPolicy};
use crate::types::{Fraction, TradeOutcome};

/// Loss magnitudes below this count as "no losing trades".
const MIN_AVG_LOSS: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Drawdown circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Normal,
    Tripped,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Tripped => write!(f, "TRIPPED"),
        }
    }
}

/// Snapshot of a single risk policy for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Full snapshot of one symbol's risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub symbol: String,
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown: f64,
    pub max_drawdown_seen: f64,
    pub kelly_fraction: f64,
    pub breaker: BreakerState,
    pub volatility_scaler: f64,
    pub return_volatility: f64,
    pub trades_recorded: usize,
    pub daily_loss_accumulated: f64,
    pub last_daily_reset: String,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    trades: VecDeque<TradeOutcome>,
    recent_returns: VecDeque<f64>,
    peak_equity: f64,
    current_equity: f64,
    max_drawdown_seen: f64,
    kelly_fraction: f64,
    breaker: BreakerState,
    volatility_scaler: f64,
    daily_loss_accumulated: f64,
    last_daily_reset: String,
}

impl Inner {
    fn drawdown_at(&self, equity: f64) -> f64 {
        if self.peak_equity > 0.0 {
            ((self.peak_equity - equity) / self.peak_equity).max(0.0)
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Pure policy functions
// ---------------------------------------------------------------------------

/// Fractional Kelly from a trade history.
///
/// Returns 1.0 (full base size) with fewer than `min_trades_for_kelly`
/// trades or when no trade has lost; a history with losses but no wins
/// clamps to the minimum.
pub fn kelly_fraction<'a>(trades: impl IntoIterator<Item = &'a TradeOutcome>, params: &RiskParams) -> f64 {
    let mut n = 0usize;
    let mut wins = 0usize;
    let mut win_sum = 0.0;
    let mut losses = 0usize;
    let mut loss_sum = 0.0;
    for t in trades {
        n += 1;
        let pnl = t.pnl.value();
        if t.pnl.is_win() {
            wins += 1;
            win_sum += pnl;
        } else if pnl < 0.0 {
            losses += 1;
            loss_sum += -pnl;
        }
    }

    if n < params.min_trades_for_kelly {
        return 1.0;
    }

    let avg_loss = if losses > 0 { loss_sum / losses as f64 } else { 0.0 };
    if avg_loss < MIN_AVG_LOSS {
        return 1.0;
    }
    let avg_win = if wins > 0 { win_sum / wins as f64 } else { 0.0 };
    let b = avg_win / avg_loss;
    if b <= 0.0 {
        return params.min_kelly;
    }

    let p = wins as f64 / n as f64;
    let optimal = (p * b - (1.0 - p)) / b;
    (optimal * params.kelly_multiplier).clamp(params.min_kelly, params.max_kelly)
}

/// Volatility scaler for a sample standard deviation.
pub fn volatility_scaler(volatility: f64, params: &RiskParams) -> f64 {
    if volatility > params.volatility_threshold {
        (1.0 - (volatility - params.volatility_threshold) * params.volatility_slope)
            .max(params.min_volatility_scaler)
    } else {
        1.0
    }
}

/// `base × kelly × scaler × breaker multiplier`, floored at
/// `min_size_fraction × base`. Non-positive bases size to zero.
pub fn position_size(base_size: f64, kelly: f64, scaler: f64, breaker_active: bool, params: &RiskParams) -> f64 {
    if !(base_size.is_finite() && base_size > 0.0) {
        return 0.0;
    }
    let breaker = if breaker_active {
        params.breaker_size_multiplier
    } else {
        1.0
    };
    (base_size * kelly * scaler * breaker).max(base_size * params.min_size_fraction)
}

// ---------------------------------------------------------------------------
// Risk Controller
// ---------------------------------------------------------------------------

/// One symbol's adaptive risk controller.
pub struct RiskController {
    symbol: String,
    params: RiskParams,
    window_policy: WindowPolicy,
    state: RwLock<Inner>,
}

impl RiskController {
    /// Create a controller for `symbol` with `initial_equity` as both the
    /// current equity and the starting peak.
    pub fn new(symbol: impl Into<String>, initial_equity: f64, params: RiskParams, window_policy: WindowPolicy) -> Self {
        let symbol = symbol.into();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            symbol = %symbol,
            initial_equity,
            max_drawdown = params.max_drawdown,
            max_daily_loss = params.max_daily_loss,
            kelly_multiplier = params.kelly_multiplier,
            "RiskController initialised"
        );

        let equity = if initial_equity.is_finite() {
            initial_equity.max(0.0)
        } else {
            0.0
        };

        Self {
            state: RwLock::new(Inner {
                trades: VecDeque::with_capacity(params.trade_history_capacity),
                recent_returns: VecDeque::with_capacity(params.return_buffer_capacity),
                peak_equity: equity,
                current_equity: equity,
                max_drawdown_seen: 0.0,
                kelly_fraction: 1.0,
                breaker: BreakerState::Normal,
                volatility_scaler: 1.0,
                daily_loss_accumulated: 0.0,
                last_daily_reset: today,
            }),
            symbol,
            params,
            window_policy,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Append a completed trade and refresh the Kelly fraction and the
    /// volatility scaler. Trades for another symbol are rejected.
    pub fn record_trade(&self, pnl: Fraction, entry_price: f64, exit_price: f64, symbol: &str) {
        if !symbol.eq_ignore_ascii_case(&self.symbol) {
            warn!(
                controller = %self.symbol,
                trade_symbol = symbol,
                "trade for a different symbol ignored"
            );
            return;
        }

        let mut s = self.state.write();
        if s.trades.len() >= self.params.trade_history_capacity.max(1) {
            s.trades.pop_front();
        }
        s.trades.push_back(TradeOutcome {
            pnl,
            entry_price,
            exit_price,
            symbol: self.symbol.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        s.kelly_fraction = kelly_fraction(&s.trades, &self.params);
        self.push_return(&mut s, pnl.value());

        debug!(
            symbol = %self.symbol,
            pnl = %pnl,
            trades = s.trades.len(),
            kelly = format!("{:.3}", s.kelly_fraction),
            scaler = format!("{:.3}", s.volatility_scaler),
            "trade result recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Drawdown / circuit breaker
    // -------------------------------------------------------------------------

    /// Feed the latest account equity. Returns whether the breaker is active
    /// after the update.
    pub fn update_drawdown(&self, current_equity: f64) -> bool {
        let mut s = self.state.write();
        if !current_equity.is_finite() {
            warn!(symbol = %self.symbol, current_equity, "non-finite equity ignored");
            return s.breaker == BreakerState::Tripped;
        }

        s.current_equity = current_equity;
        if current_equity > s.peak_equity {
            s.peak_equity = current_equity;
        }
        let drawdown = s.drawdown_at(current_equity);
        if drawdown > s.max_drawdown_seen {
            s.max_drawdown_seen = drawdown;
        }

        let reset_level = self.params.max_drawdown * self.params.breaker_reset_ratio;
        let breaker = s.breaker;
        match breaker {
            BreakerState::Normal if drawdown > self.params.max_drawdown => {
                s.breaker = BreakerState::Tripped;
                warn!(
                    symbol = %self.symbol,
                    drawdown = format!("{:.2}%", drawdown * 100.0),
                    limit = format!("{:.2}%", self.params.max_drawdown * 100.0),
                    "drawdown circuit breaker tripped"
                );
            }
            BreakerState::Tripped if drawdown < reset_level => {
                s.breaker = BreakerState::Normal;
                info!(
                    symbol = %self.symbol,
                    drawdown = format!("{:.2}%", drawdown * 100.0),
                    reset_level = format!("{:.2}%", reset_level * 100.0),
                    "drawdown circuit breaker reset"
                );
            }
            _ => {}
        }

        s.breaker == BreakerState::Tripped
    }

    // -------------------------------------------------------------------------
    // Volatility scaler
    // -------------------------------------------------------------------------

    /// Push one return (or volatility) sample into the ring buffer and
    /// recompute the scaler.
    pub fn update_volatility_scaler(&self, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        let mut s = self.state.write();
        self.push_return(&mut s, sample);
    }

    fn push_return(&self, s: &mut Inner, sample: f64) {
        if s.recent_returns.len() >= self.params.return_buffer_capacity.max(1) {
            s.recent_returns.pop_front();
        }
        s.recent_returns.push_back(sample);
        let samples: Vec<f64> = s.recent_returns.iter().copied().collect();
        s.volatility_scaler = volatility_scaler(population_std(&samples), &self.params);
    }

    // -------------------------------------------------------------------------
    // Sizing and gates
    // -------------------------------------------------------------------------

    /// Risk-adjusted size for a `base_size` unit.
    ///
    /// Reads the current state only. The breaker multiplier applies when the
    /// breaker is tripped or when `current_equity` would trip it against the
    /// recorded peak.
    pub fn calculate_position_size(&self, base_size: f64, current_equity: f64) -> f64 {
        let s = self.state.read();
        let would_trip = current_equity.is_finite() && s.drawdown_at(current_equity) > self.params.max_drawdown;
        let breaker_active = s.breaker == BreakerState::Tripped || would_trip;
        position_size(
            base_size,
            s.kelly_fraction,
            s.volatility_scaler,
            breaker_active,
            &self.params,
        )
    }

    /// Whether `accumulated_loss` (a positive amount in account currency)
    /// still leaves room under today's loss limit.
    pub fn can_trade_today(&self, accumulated_loss: f64) -> bool {
        let s = self.state.read();
        if s.current_equity <= 0.0 {
            return false;
        }
        let limit = self.params.max_daily_loss * s.current_equity;
        let loss = accumulated_loss.max(0.0);
        if loss >= limit {
            debug!(
                symbol = %self.symbol,
                loss,
                limit,
                "daily loss limit reached"
            );
            return false;
        }
        true
    }

    /// Add a realised loss (positive amount) to today's accumulator.
    pub fn accumulate_daily_loss(&self, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.state.write().daily_loss_accumulated += amount;
        }
    }

    /// [`can_trade_today`](Self::can_trade_today) against the internal
    /// accumulator.
    pub fn can_trade_today_accumulated(&self) -> bool {
        let loss = self.state.read().daily_loss_accumulated;
        self.can_trade_today(loss)
    }

    /// Clear today's loss accumulator (called by the caller on day rollover).
    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        s.daily_loss_accumulated = 0.0;
        s.last_daily_reset = today.clone();
        info!(symbol = %self.symbol, date = %today, "daily loss accumulator reset");
    }

    // -------------------------------------------------------------------------
    // Accessors / snapshot
    // -------------------------------------------------------------------------

    pub fn kelly_fraction(&self) -> f64 {
        self.state.read().kelly_fraction
    }

    pub fn volatility_scaler(&self) -> f64 {
        self.state.read().volatility_scaler
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.state.read().breaker
    }

    pub fn is_circuit_breaker_active(&self) -> bool {
        self.breaker_state() == BreakerState::Tripped
    }

    pub fn current_equity(&self) -> f64 {
        self.state.read().current_equity
    }

    pub fn trade_count(&self) -> usize {
        self.state.read().trades.len()
    }

    /// Build a serialisable snapshot of the current risk state.
    pub fn snapshot(&self) -> RiskSnapshot {
        let s = self.state.read();
        let samples: Vec<f64> = s.recent_returns.iter().copied().collect();
        let return_volatility = population_std(&samples);
        let drawdown = s.drawdown_at(s.current_equity);
        let daily_loss_pct = if s.current_equity > 0.0 {
            s.daily_loss_accumulated / s.current_equity
        } else {
            0.0
        };

        let circuit_breakers = vec![
            CircuitBreakerInfo {
                name: "Max Drawdown".to_string(),
                current: drawdown * 100.0,
                limit: self.params.max_drawdown * 100.0,
                tripped: s.breaker == BreakerState::Tripped,
            },
            CircuitBreakerInfo {
                name: "Daily Loss".to_string(),
                current: daily_loss_pct * 100.0,
                limit: self.params.max_daily_loss * 100.0,
                tripped: daily_loss_pct >= self.params.max_daily_loss,
            },
            CircuitBreakerInfo {
                name: "Volatility".to_string(),
                current: return_volatility,
                limit: self.params.volatility_threshold,
                tripped: s.volatility_scaler < 1.0,
            },
        ];

        RiskSnapshot {
            symbol: self.symbol.clone(),
            peak_equity: s.peak_equity,
            current_equity: s.current_equity,
            drawdown,
            max_drawdown_seen: s.max_drawdown_seen,
            kelly_fraction: s.kelly_fraction,
            breaker: s.breaker,
            volatility_scaler: s.volatility_scaler,
            return_volatility,
            trades_recorded: s.trades.len(),
            daily_loss_accumulated: s.daily_loss_accumulated,
            last_daily_reset: s.last_daily_reset.clone(),
            circuit_breakers,
        }
    }
}

impl WindowSizePolicy for RiskController {
    fn window_size(&self, symbol: &str, volatility: f64) -> usize {
        self.window_policy.lookup(symbol, volatility)
    }

    fn observe_volatility(&self, volatility: f64) {
        self.update_volatility_scaler(volatility);
    }
}

impl std::fmt::Debug for RiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskController")
            .field("symbol", &self.symbol)
            .field("max_drawdown", &self.params.max_drawdown)
            .field("max_daily_loss", &self.params.max_daily_loss)
            .field("kelly_multiplier", &self.params.kelly_multiplier)
            .finish()
    }
}
