//! Trading configuration: targets, risk knobs, and management tunables.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for sizing, entry gating, and trade management.
///
/// Immutable once the bot is constructed; components receive only the
/// parameters they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Approximate profit target per trade, in account currency
    pub per_trade_target_eur: Decimal,

    /// Cumulative session target; the loop stops once reached
    pub daily_target_eur: Decimal,

    /// Stop distance as a multiple of the take-profit distance (clamped >= 1)
    pub stop_to_limit_multiplier: Decimal,

    /// Advisory margin budget for one position, in account currency
    pub margin_budget_eur: Decimal,

    /// ATR lookback in bars
    pub atr_period: usize,

    /// EMA lookback used for signal invalidation
    pub ema_period: usize,

    /// Minimum ATR (points) required to enter or stay in a trade
    pub atr_min_threshold: Decimal,

    /// Maximum bid/ask spread (points) tolerated to enter or stay in a trade
    pub spread_max_points: Decimal,

    /// Fraction of the TP distance that arms breakeven + trailing
    pub breakeven_trigger_ratio: Decimal,

    /// Offset beyond entry for the breakeven stop, in points
    pub breakeven_offset_points: Decimal,

    /// Trailing stop distance as a multiple of ATR
    pub trail_dist_atr_mult: Decimal,

    /// Trailing stop increment as a multiple of ATR
    pub trail_step_atr_mult: Decimal,

    /// Floor for the trailing stop increment, in points
    pub min_trail_step_points: Decimal,

    /// Seconds between position-management polls
    pub poll_positions_secs: u64,

    /// Base backoff after a failed dealing call, in seconds
    pub retry_backoff_secs: u64,

    /// Sleep while outside the configured session windows, in seconds
    pub session_idle_sleep_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            per_trade_target_eur: dec!(1.0),
            daily_target_eur: dec!(10.0),
            stop_to_limit_multiplier: dec!(3.0),
            margin_budget_eur: dec!(500.0),
            atr_period: 14,
            ema_period: 20,
            atr_min_threshold: dec!(3.0),
            spread_max_points: dec!(3.0),
            breakeven_trigger_ratio: dec!(0.5),
            breakeven_offset_points: dec!(0.1),
            trail_dist_atr_mult: dec!(0.8),
            trail_step_atr_mult: dec!(0.3),
            min_trail_step_points: dec!(0.1),
            poll_positions_secs: 5,
            retry_backoff_secs: 1,
            session_idle_sleep_secs: 30,
        }
    }
}
