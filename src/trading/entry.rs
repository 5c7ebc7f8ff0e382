//! Pre-trade gates: volatility floor and spread cap, then direction.

use rust_decimal::Decimal;
use tracing::debug;

use crate::indicators::{atr, IndicatorError};
use crate::models::{Bar, Direction};

use super::config::TradingConfig;
use super::strategy::DirectionStrategy;

/// Outcome of the entry check for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    Enter(Direction),
    Skip(String),
}

/// Gates a prospective entry on market conditions before asking the
/// strategy for a side. All gates read completed bars only.
pub struct EntryGate {
    atr_period: usize,
    atr_min_threshold: Decimal,
    spread_max_points: Decimal,
    strategy: DirectionStrategy,
}

impl EntryGate {
    pub fn new(config: &TradingConfig, strategy: DirectionStrategy) -> Self {
        Self {
            atr_period: config.atr_period,
            atr_min_threshold: config.atr_min_threshold,
            spread_max_points: config.spread_max_points,
            strategy,
        }
    }

    pub fn strategy(&self) -> &DirectionStrategy {
        &self.strategy
    }

    /// Evaluate the gates in order: ATR floor, spread cap, strategy signal.
    /// The first failing gate wins and its reason is reported.
    pub fn evaluate(&self, bars: &[Bar], spread: Option<Decimal>) -> EntryDecision {
        let atr_now = match atr(bars, self.atr_period) {
            Ok(v) => v,
            Err(IndicatorError::InsufficientData { needed, got }) => {
                return EntryDecision::Skip(format!(
                    "not enough bars for ATR ({got}/{needed})"
                ));
            }
        };
        if atr_now < self.atr_min_threshold {
            return EntryDecision::Skip(format!(
                "ATR {atr_now} below threshold {}",
                self.atr_min_threshold
            ));
        }

        if let Some(spread) = spread {
            if spread > self.spread_max_points {
                return EntryDecision::Skip(format!(
                    "spread {spread} above cap {}",
                    self.spread_max_points
                ));
            }
        }

        match self.strategy.direction(bars) {
            Some(direction) => {
                debug!(%atr_now, %direction, "entry gates passed");
                EntryDecision::Enter(direction)
            }
            None => EntryDecision::Skip("no directional signal".to_string()),
        }
    }
}
