//! Lifecycle management of a single open position.
//!
//! `TradeManager` is deliberately pure: `on_tick` inspects market state and
//! proposes at most one action, and internal state only advances through
//! `confirm_stop_update` once the dealing call has actually succeeded. A
//! failed stop amendment therefore re-proposes itself on the next tick
//! instead of desynchronizing the manager from the broker.
//!
//! The trailing stop itself runs broker-side; this manager only arms it at
//! the breakeven transition and refreshes its distance and increment when
//! ATR has moved them materially.

use rust_decimal::Decimal;
use tracing::debug;

use crate::indicators::{atr, ema};
use crate::models::{Bar, Direction, Quote};

use super::config::TradingConfig;

/// A position as the manager tracks it, refreshed from broker state on open.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub deal_id: String,
    pub direction: Direction,
    pub entry_level: Decimal,
    pub size: Decimal,
    pub stop_level: Decimal,
    pub limit_level: Decimal,
}

/// Broker-side trailing stop parameters, in points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingParams {
    pub distance: Decimal,
    pub step: Decimal,
}

/// A proposed stop amendment. `arms_breakeven` marks the one-time move to
/// entry plus offset; it flips the armed flag when confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopUpdate {
    pub stop_level: Decimal,
    pub trailing: Option<TrailingParams>,
    pub arms_breakeven: bool,
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Filled at the limit or stopped out above water after breakeven.
    FavorableTpOrTrail,
    /// Last completed close crossed the invalidation EMA against us.
    Invalidation,
    /// ATR fell back below the entry threshold mid-trade.
    VolatilityDrop,
    /// Spread blew out past the entry cap mid-trade.
    SpreadSpike,
    /// Position vanished broker-side without a favorable reading.
    External,
}

impl CloseReason {
    /// Only favorable exits count toward the daily target.
    pub fn is_favorable(self) -> bool {
        matches!(self, CloseReason::FavorableTpOrTrail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::FavorableTpOrTrail => "favorable",
            CloseReason::Invalidation => "invalidation",
            CloseReason::VolatilityDrop => "volatility_drop",
            CloseReason::SpreadSpike => "spread_spike",
            CloseReason::External => "external",
        }
    }
}

/// What the orchestrator should do this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    Hold,
    UpdateStop(StopUpdate),
    Close {
        reason: CloseReason,
        move_points: Decimal,
    },
}

pub struct TradeManager {
    position: OpenPosition,
    take_profit_distance: Decimal,
    min_stop_distance: Decimal,
    breakeven_armed: bool,
    trailing: Option<TrailingParams>,

    ema_period: usize,
    atr_period: usize,
    atr_min_threshold: Decimal,
    spread_max_points: Decimal,
    breakeven_trigger_ratio: Decimal,
    breakeven_offset_points: Decimal,
    trail_dist_atr_mult: Decimal,
    trail_step_atr_mult: Decimal,
    min_trail_step_points: Decimal,
}

impl TradeManager {
    pub fn new(
        config: &TradingConfig,
        position: OpenPosition,
        take_profit_distance: Decimal,
        min_stop_distance: Decimal,
    ) -> Self {
        Self {
            position,
            take_profit_distance,
            min_stop_distance,
            breakeven_armed: false,
            trailing: None,
            ema_period: config.ema_period,
            atr_period: config.atr_period,
            atr_min_threshold: config.atr_min_threshold,
            spread_max_points: config.spread_max_points,
            breakeven_trigger_ratio: config.breakeven_trigger_ratio,
            breakeven_offset_points: config.breakeven_offset_points,
            trail_dist_atr_mult: config.trail_dist_atr_mult,
            trail_step_atr_mult: config.trail_step_atr_mult,
            min_trail_step_points: config.min_trail_step_points,
        }
    }

    pub fn position(&self) -> &OpenPosition {
        &self.position
    }

    pub fn breakeven_armed(&self) -> bool {
        self.breakeven_armed
    }

    /// Signed move in our favor, in points.
    fn favorable_move(&self, mid: Decimal) -> Decimal {
        match self.position.direction {
            Direction::Buy => mid - self.position.entry_level,
            Direction::Sell => self.position.entry_level - mid,
        }
    }

    /// Evaluate the open trade against fresh bars and a live quote.
    ///
    /// Check order: trend invalidation first, then condition deterioration,
    /// then breakeven arming, then trailing refresh. Bars must be completed
    /// bars; too few bars for the indicators holds rather than guesses.
    pub fn on_tick(&self, bars: &[Bar], quote: &Quote) -> TickDecision {
        let move_points = self.favorable_move(quote.mid);

        let (Ok(ema_now), Ok(atr_now)) =
            (ema(bars, self.ema_period), atr(bars, self.atr_period))
        else {
            return TickDecision::Hold;
        };

        let last_close = match bars.last() {
            Some(bar) => bar.close,
            None => return TickDecision::Hold,
        };
        let invalidated = match self.position.direction {
            Direction::Buy => last_close < ema_now,
            Direction::Sell => last_close > ema_now,
        };
        if invalidated {
            return TickDecision::Close {
                reason: CloseReason::Invalidation,
                move_points,
            };
        }

        if atr_now < self.atr_min_threshold {
            return TickDecision::Close {
                reason: CloseReason::VolatilityDrop,
                move_points,
            };
        }
        if let Some(spread) = quote.spread {
            if spread > self.spread_max_points {
                return TickDecision::Close {
                    reason: CloseReason::SpreadSpike,
                    move_points,
                };
            }
        }

        if !self.breakeven_armed {
            let trigger = self.take_profit_distance * self.breakeven_trigger_ratio;
            if move_points >= trigger {
                let breakeven = self.breakeven_stop();
                let stop_level = if self.improves_stop(breakeven) {
                    breakeven
                } else {
                    // Stop already at or past breakeven; arm without
                    // loosening it.
                    self.position.stop_level
                };
                return TickDecision::UpdateStop(StopUpdate {
                    stop_level,
                    trailing: Some(self.trailing_params(atr_now)),
                    arms_breakeven: true,
                });
            }
            return TickDecision::Hold;
        }

        let desired = self.trailing_params(atr_now);
        if self.trailing != Some(desired) {
            debug!(
                distance = %desired.distance,
                step = %desired.step,
                "trailing parameters drifted, refreshing"
            );
            return TickDecision::UpdateStop(StopUpdate {
                stop_level: self.position.stop_level,
                trailing: Some(desired),
                arms_breakeven: false,
            });
        }
        TickDecision::Hold
    }

    fn breakeven_stop(&self) -> Decimal {
        let stop = match self.position.direction {
            Direction::Buy => self.position.entry_level + self.breakeven_offset_points,
            Direction::Sell => self.position.entry_level - self.breakeven_offset_points,
        };
        stop.round_dp(2)
    }

    /// True if `candidate` is strictly tighter than the current stop.
    fn improves_stop(&self, candidate: Decimal) -> bool {
        match self.position.direction {
            Direction::Buy => candidate > self.position.stop_level,
            Direction::Sell => candidate < self.position.stop_level,
        }
    }

    /// Trailing distance and increment scaled from current ATR, clamped to
    /// the instrument and configuration floors. Rounded to the 2 dp the
    /// dealing API accepts, which doubles as the material-difference check.
    fn trailing_params(&self, atr_now: Decimal) -> TrailingParams {
        TrailingParams {
            distance: (atr_now * self.trail_dist_atr_mult)
                .max(self.min_stop_distance)
                .round_dp(2),
            step: (atr_now * self.trail_step_atr_mult)
                .max(self.min_trail_step_points)
                .round_dp(2),
        }
    }

    /// Commit a proposed amendment after the broker accepted it.
    pub fn confirm_stop_update(&mut self, update: &StopUpdate) {
        self.position.stop_level = update.stop_level;
        if let Some(trailing) = update.trailing {
            self.trailing = Some(trailing);
        }
        if update.arms_breakeven {
            self.breakeven_armed = true;
        }
    }

    /// The position disappeared broker-side. Classify the exit from the
    /// realized P&L when the transaction history yields one, otherwise from
    /// whether breakeven was armed (a stop-out past breakeven nets a gain).
    pub fn on_external_exit(&self, realized_pnl: Option<Decimal>) -> CloseReason {
        let favorable = match realized_pnl {
            Some(pnl) => pnl > Decimal::ZERO,
            None => self.breakeven_armed,
        };
        if favorable {
            CloseReason::FavorableTpOrTrail
        } else {
            CloseReason::External
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn config() -> TradingConfig {
        TradingConfig {
            atr_period: 2,
            ema_period: 3,
            atr_min_threshold: dec!(1.0),
            spread_max_points: dec!(3.0),
            breakeven_trigger_ratio: dec!(0.5),
            breakeven_offset_points: dec!(0.1),
            trail_dist_atr_mult: dec!(0.8),
            trail_step_atr_mult: dec!(0.3),
            min_trail_step_points: dec!(0.1),
            ..TradingConfig::default()
        }
    }

    fn long_at_100() -> OpenPosition {
        OpenPosition {
            deal_id: "DEAL1".to_string(),
            direction: Direction::Buy,
            entry_level: dec!(100),
            size: dec!(1),
            stop_level: dec!(70),
            limit_level: dec!(110),
        }
    }

    fn manager_for(position: OpenPosition) -> TradeManager {
        TradeManager::new(&config(), position, dec!(10), dec!(1))
    }

    /// Healthy bars: steady closes around `close` with enough range to keep
    /// ATR above the floor and the close at the EMA.
    fn healthy_bars(close: Decimal) -> Vec<Bar> {
        (0..4)
            .map(|_| Bar {
                timestamp: Utc::now(),
                open: close,
                high: close + dec!(2),
                low: close,
                close,
            })
            .collect()
    }

    fn bars_from_closes(closes: &[Decimal]) -> Vec<Bar> {
        closes
            .iter()
            .map(|&c| Bar {
                timestamp: Utc::now(),
                open: c,
                high: c + dec!(2),
                low: c,
                close: c,
            })
            .collect()
    }

    fn quote(mid: Decimal) -> Quote {
        Quote {
            mid,
            spread: Some(dec!(1.0)),
        }
    }

    #[test]
    fn arms_breakeven_at_half_tp_not_before() {
        let manager = manager_for(long_at_100());

        // 4.9 points in favor: short of the 5.0 trigger.
        let decision = manager.on_tick(&healthy_bars(dec!(104.9)), &quote(dec!(104.9)));
        assert_eq!(decision, TickDecision::Hold);

        // 5.0 points: stop moves to entry + offset and trailing arms.
        // ATR is 2: distance 1.6, step 0.6.
        let decision = manager.on_tick(&healthy_bars(dec!(105.0)), &quote(dec!(105.0)));
        assert_eq!(
            decision,
            TickDecision::UpdateStop(StopUpdate {
                stop_level: dec!(100.1),
                trailing: Some(TrailingParams {
                    distance: dec!(1.6),
                    step: dec!(0.6),
                }),
                arms_breakeven: true,
            })
        );
    }

    #[test]
    fn arming_sticks_only_after_confirmation() {
        let mut manager = manager_for(long_at_100());
        let bars = healthy_bars(dec!(105.0));

        let TickDecision::UpdateStop(update) = manager.on_tick(&bars, &quote(dec!(105.0)))
        else {
            panic!("expected a stop update");
        };
        assert!(!manager.breakeven_armed());

        // The dealing call failed: the same proposal comes back next tick.
        assert_eq!(
            manager.on_tick(&bars, &quote(dec!(105.0))),
            TickDecision::UpdateStop(update.clone())
        );

        manager.confirm_stop_update(&update);
        assert!(manager.breakeven_armed());
        assert_eq!(manager.position().stop_level, dec!(100.1));
    }

    #[test]
    fn arming_never_loosens_an_already_tighter_stop() {
        let mut position = long_at_100();
        position.stop_level = dec!(102);
        let manager = manager_for(position);

        let TickDecision::UpdateStop(update) =
            manager.on_tick(&healthy_bars(dec!(105.0)), &quote(dec!(105.0)))
        else {
            panic!("expected a stop update");
        };
        assert_eq!(update.stop_level, dec!(102));
        assert!(update.arms_breakeven);
    }

    #[test]
    fn close_below_ema_invalidates_long() {
        let manager = manager_for(long_at_100());

        // Declining closes put the last close under the 3-bar EMA.
        let bars = bars_from_closes(&[dec!(106), dec!(104), dec!(102), dec!(98)]);
        match manager.on_tick(&bars, &quote(dec!(98))) {
            TickDecision::Close { reason, .. } => {
                assert_eq!(reason, CloseReason::Invalidation);
                assert!(!reason.is_favorable());
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn atr_collapse_closes_the_trade() {
        let mut cfg = config();
        cfg.atr_min_threshold = dec!(3.0);
        let manager = TradeManager::new(&cfg, long_at_100(), dec!(10), dec!(1));

        // Range 2 keeps ATR at 2, under the 3.0 floor.
        match manager.on_tick(&healthy_bars(dec!(101)), &quote(dec!(101))) {
            TickDecision::Close { reason, .. } => {
                assert_eq!(reason, CloseReason::VolatilityDrop)
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn spread_spike_closes_the_trade() {
        let manager = manager_for(long_at_100());
        let bad_quote = Quote {
            mid: dec!(101),
            spread: Some(dec!(5.0)),
        };
        match manager.on_tick(&healthy_bars(dec!(101)), &bad_quote) {
            TickDecision::Close { reason, .. } => {
                assert_eq!(reason, CloseReason::SpreadSpike)
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn trailing_refresh_is_idempotent_under_unchanged_atr() {
        let mut manager = manager_for(long_at_100());
        manager.confirm_stop_update(&StopUpdate {
            stop_level: dec!(100.1),
            trailing: Some(TrailingParams {
                distance: dec!(1.6),
                step: dec!(0.6),
            }),
            arms_breakeven: true,
        });

        // Same ATR (range 2) as the confirmed parameters: nothing to do.
        let bars = healthy_bars(dec!(106));
        assert_eq!(manager.on_tick(&bars, &quote(dec!(106))), TickDecision::Hold);
        assert_eq!(manager.on_tick(&bars, &quote(dec!(107))), TickDecision::Hold);
    }

    #[test]
    fn trailing_refresh_follows_atr_changes() {
        let mut manager = manager_for(long_at_100());
        manager.confirm_stop_update(&StopUpdate {
            stop_level: dec!(100.1),
            trailing: Some(TrailingParams {
                distance: dec!(1.6),
                step: dec!(0.6),
            }),
            arms_breakeven: true,
        });

        // Widen the bar range to 4: ATR 4 -> distance 3.2, step 1.2.
        let close = dec!(106);
        let bars: Vec<Bar> = (0..4)
            .map(|_| Bar {
                timestamp: Utc::now(),
                open: close,
                high: close + dec!(4),
                low: close,
                close,
            })
            .collect();
        assert_eq!(
            manager.on_tick(&bars, &quote(close)),
            TickDecision::UpdateStop(StopUpdate {
                stop_level: dec!(100.1),
                trailing: Some(TrailingParams {
                    distance: dec!(3.2),
                    step: dec!(1.2),
                }),
                arms_breakeven: false,
            })
        );
    }

    #[test]
    fn trailing_params_respect_floors() {
        let manager = manager_for(long_at_100());
        // ATR 0.5 would give distance 0.4 and step 0.15; the instrument
        // minimum of 1 and the configured step floor apply.
        let params = manager.trailing_params(dec!(0.5));
        assert_eq!(params.distance, dec!(1));
        assert_eq!(params.step, dec!(0.15));

        let params = manager.trailing_params(dec!(0.1));
        assert_eq!(params.step, dec!(0.1));
    }

    #[test]
    fn short_side_mirrors_arming() {
        let position = OpenPosition {
            deal_id: "DEAL2".to_string(),
            direction: Direction::Sell,
            entry_level: dec!(100),
            size: dec!(1),
            stop_level: dec!(130),
            limit_level: dec!(90),
        };
        let manager = manager_for(position);

        // Shorts invalidate on closes above the EMA, so feed declining
        // closes and read the quote for the arming trigger.
        let bars = bars_from_closes(&[dec!(100), dec!(98), dec!(96), dec!(95)]);
        let TickDecision::UpdateStop(update) = manager.on_tick(&bars, &quote(dec!(95)))
        else {
            panic!("expected a stop update");
        };
        assert_eq!(update.stop_level, dec!(99.9));
        assert!(update.arms_breakeven);
    }

    #[test]
    fn external_exit_classification() {
        let mut manager = manager_for(long_at_100());

        assert_eq!(
            manager.on_external_exit(Some(dec!(1.20))),
            CloseReason::FavorableTpOrTrail
        );
        assert_eq!(
            manager.on_external_exit(Some(dec!(-0.50))),
            CloseReason::External
        );
        assert_eq!(manager.on_external_exit(None), CloseReason::External);

        manager.confirm_stop_update(&StopUpdate {
            stop_level: dec!(100.1),
            trailing: None,
            arms_breakeven: true,
        });
        assert_eq!(
            manager.on_external_exit(None),
            CloseReason::FavorableTpOrTrail
        );
    }
}
