//! Direction strategies: which side to take once the entry gates pass.
//!
//! The default micro-momentum rule compares the last two completed closes
//! (ties favor BUY). The alternatives reproduce common scalping setups on
//! the same bar feed; each returns `None` when its setup is absent, which
//! simply withholds the entry this tick.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::{parabolic_sar, rsi_series, sma, stoch_kd};
use crate::models::{Bar, Direction};

/// Which signal rule drives direction selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    MicroMomentum,
    MovingAverage,
    Rsi,
    Stochastic,
    ParabolicSar,
}

impl SignalKind {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "moving_average" | "ma" => Self::MovingAverage,
            "rsi" => Self::Rsi,
            "stochastic" | "stoch" => Self::Stochastic,
            "parabolic_sar" | "psar" => Self::ParabolicSar,
            _ => Self::MicroMomentum,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MicroMomentum => "micro_momentum",
            Self::MovingAverage => "moving_average",
            Self::Rsi => "rsi",
            Self::Stochastic => "stochastic",
            Self::ParabolicSar => "parabolic_sar",
        }
    }

    /// Bars the strategy needs to evaluate, used when sizing the price fetch.
    pub fn bars_needed(self, cfg: &StrategyConfig) -> usize {
        match self {
            Self::MicroMomentum => 3,
            Self::MovingAverage => (cfg.ma_trend + cfg.ma_slow + 2).max(230),
            Self::Rsi => (cfg.ma_trend + cfg.rsi_period + 2).max(230),
            Self::Stochastic => (cfg.ma_trend + cfg.sto_k_period + cfg.sto_d_period + 2).max(230),
            Self::ParabolicSar => 150,
        }
    }
}

/// Indicator parameters for the selectable strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub ma_fast: usize,
    pub ma_slow: usize,
    pub ma_trend: usize,

    pub sto_k_period: usize,
    pub sto_d_period: usize,
    pub sto_lo: Decimal,
    pub sto_hi: Decimal,

    pub rsi_period: usize,
    pub rsi_lo: Decimal,
    pub rsi_hi: Decimal,

    pub psar_af: Decimal,
    pub psar_af_max: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ma_fast: 5,
            ma_slow: 20,
            ma_trend: 200,
            sto_k_period: 14,
            sto_d_period: 3,
            sto_lo: dec!(20.0),
            sto_hi: dec!(80.0),
            rsi_period: 14,
            rsi_lo: dec!(30.0),
            rsi_hi: dec!(70.0),
            psar_af: dec!(0.02),
            psar_af_max: dec!(0.2),
        }
    }
}

/// Strategy selector bound to its parameters.
#[derive(Debug, Clone)]
pub struct DirectionStrategy {
    kind: SignalKind,
    config: StrategyConfig,
}

impl DirectionStrategy {
    pub fn new(kind: SignalKind, config: StrategyConfig) -> Self {
        Self { kind, config }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn bars_needed(&self) -> usize {
        self.kind.bars_needed(&self.config)
    }

    /// Direction for the next trade, from completed bars only.
    pub fn direction(&self, bars: &[Bar]) -> Option<Direction> {
        match self.kind {
            SignalKind::MicroMomentum => micro_momentum(bars),
            SignalKind::MovingAverage => moving_average(bars, &self.config),
            SignalKind::Rsi => rsi(bars, &self.config),
            SignalKind::Stochastic => stochastic(bars, &self.config),
            SignalKind::ParabolicSar => psar(bars, &self.config),
        }
    }
}

/// Last two 1-minute closes; ties favor BUY.
fn micro_momentum(bars: &[Bar]) -> Option<Direction> {
    if bars.len() < 2 {
        return None;
    }
    let prev = bars[bars.len() - 2].close;
    let last = bars[bars.len() - 1].close;
    if last >= prev {
        Some(Direction::Buy)
    } else {
        Some(Direction::Sell)
    }
}

/// Trend slope of the long SMA: (up, down). Flat counts as neither.
fn trend(closes: &[Decimal], period: usize) -> Option<(bool, bool)> {
    let now = sma(closes, period)?;
    let prev = sma(&closes[..closes.len() - 1], period)?;
    Some((now > prev, now < prev))
}

/// Fast/slow SMA cross with a long-SMA trend filter.
fn moving_average(bars: &[Bar], cfg: &StrategyConfig) -> Option<Direction> {
    if bars.len() < cfg.ma_trend + cfg.ma_slow + 1 {
        return None;
    }
    let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();
    let (trend_up, trend_down) = trend(&closes, cfg.ma_trend)?;

    let fast_now = sma(&closes, cfg.ma_fast)?;
    let fast_prev = sma(&closes[..closes.len() - 1], cfg.ma_fast)?;
    let slow_now = sma(&closes, cfg.ma_slow)?;
    let slow_prev = sma(&closes[..closes.len() - 1], cfg.ma_slow)?;

    let bull_cross = fast_prev <= slow_prev && fast_now > slow_now;
    let bear_cross = fast_prev >= slow_prev && fast_now < slow_now;
    if bull_cross && trend_up {
        return Some(Direction::Buy);
    }
    if bear_cross && trend_down {
        return Some(Direction::Sell);
    }
    None
}

/// RSI rebound up from the low band / roll-off down from the high band,
/// trend-filtered.
fn rsi(bars: &[Bar], cfg: &StrategyConfig) -> Option<Direction> {
    if bars.len() < cfg.ma_trend + cfg.rsi_period + 1 {
        return None;
    }
    let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();
    let (trend_up, trend_down) = trend(&closes, cfg.ma_trend)?;

    let rsis = rsi_series(&closes, cfg.rsi_period);
    if rsis.len() < 2 {
        return None;
    }
    let r_prev = rsis[rsis.len() - 2];
    let r_now = rsis[rsis.len() - 1];

    if r_prev <= cfg.rsi_lo && r_now > cfg.rsi_lo && trend_up {
        return Some(Direction::Buy);
    }
    if r_prev >= cfg.rsi_hi && r_now < cfg.rsi_hi && trend_down {
        return Some(Direction::Sell);
    }
    None
}

/// %K/%D cross out of the oversold/overbought zone, trend-filtered.
fn stochastic(bars: &[Bar], cfg: &StrategyConfig) -> Option<Direction> {
    if bars.len() < cfg.ma_trend + cfg.sto_k_period + cfg.sto_d_period {
        return None;
    }
    let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();
    let (trend_up, trend_down) = trend(&closes, cfg.ma_trend)?;

    let (k_vals, d_vals) = stoch_kd(bars, cfg.sto_k_period, cfg.sto_d_period);
    if k_vals.len() < 2 || d_vals.len() < 2 {
        return None;
    }
    let (k_prev, k_now) = (k_vals[k_vals.len() - 2], k_vals[k_vals.len() - 1]);
    let (d_prev, d_now) = (d_vals[d_vals.len() - 2], d_vals[d_vals.len() - 1]);

    let bull_cross = k_prev <= d_prev && k_now > d_now && k_prev < cfg.sto_lo;
    let bear_cross = k_prev >= d_prev && k_now < d_now && k_prev > cfg.sto_hi;
    if bull_cross && trend_up {
        return Some(Direction::Buy);
    }
    if bear_cross && trend_down {
        return Some(Direction::Sell);
    }
    None
}

/// Enter when the close crosses the SAR (flip).
fn psar(bars: &[Bar], cfg: &StrategyConfig) -> Option<Direction> {
    if bars.len() < 5 {
        return None;
    }
    let sar = parabolic_sar(bars, cfg.psar_af, cfg.psar_af_max);
    if sar.len() < 2 {
        return None;
    }
    let prev_above = bars[bars.len() - 2].close > sar[sar.len() - 2];
    let now_above = bars[bars.len() - 1].close > sar[sar.len() - 1];
    if !prev_above && now_above {
        return Some(Direction::Buy);
    }
    if prev_above && !now_above {
        return Some(Direction::Sell);
    }
    None
}
