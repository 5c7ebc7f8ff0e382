//! Position sizing: deal size and stop/limit distances from instrument
//! metadata and the per-trade target.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::InstrumentMetadata;

/// Sizing errors. Fatal to the current trade attempt only; the session loop
/// retries with fresh metadata on the next cycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    #[error("degenerate instrument metadata: {0}")]
    DegenerateMetadata(&'static str),
}

/// Snapshot of one sizing computation, attached to the position at open time.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingResult {
    /// Deal size, at least the instrument minimum, rounded to 2 dp
    pub size: Decimal,
    /// Take-profit distance in points
    pub take_profit_distance: Decimal,
    /// Stop-loss distance in points, a fixed multiple of the TP distance
    pub stop_loss_distance: Decimal,
    pub currency: String,
}

/// Derives size and stop/limit distances for one trade.
pub struct SizingCalculator {
    per_trade_target_eur: Decimal,
    margin_budget_eur: Decimal,
    stop_to_limit_multiplier: Decimal,
}

impl SizingCalculator {
    pub fn new(
        per_trade_target_eur: Decimal,
        margin_budget_eur: Decimal,
        stop_to_limit_multiplier: Decimal,
    ) -> Self {
        Self {
            per_trade_target_eur,
            margin_budget_eur,
            stop_to_limit_multiplier,
        }
    }

    /// Compute a sizing result from fresh instrument metadata.
    ///
    /// The candidate size starts at the instrument minimum and is never
    /// grown; the take-profit distance is whatever yields the per-trade
    /// target at that size, clamped up to the instrument's minimum normal
    /// stop/limit distance. When the minimum-compliant distance yields more
    /// than the target, the larger distance wins.
    ///
    /// The margin budget is advisory: a breach at minimum size is logged and
    /// the trade proceeds, since there is no smaller compliant size.
    pub fn compute(&self, meta: &InstrumentMetadata) -> Result<SizingResult, SizingError> {
        if meta.value_of_one_pip <= Decimal::ZERO {
            return Err(SizingError::DegenerateMetadata("valueOfOnePip must be positive"));
        }
        if meta.one_pip_means <= Decimal::ZERO {
            return Err(SizingError::DegenerateMetadata("onePipMeans must be positive"));
        }
        if meta.min_deal_size <= Decimal::ZERO {
            return Err(SizingError::DegenerateMetadata("minDealSize must be positive"));
        }
        if meta.min_stop_distance < Decimal::ZERO {
            return Err(SizingError::DegenerateMetadata(
                "minNormalStopOrLimitDistance must not be negative",
            ));
        }

        // Candidate size starts (and stays) at the instrument minimum,
        // rounded up to the 2 dp granularity IG accepts.
        let size = meta
            .min_deal_size
            .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);

        // Distance in points such that distance / onePipMeans * pipValue * size
        // hits the per-trade target.
        let points_needed =
            self.per_trade_target_eur * meta.one_pip_means / (meta.value_of_one_pip * size);
        let take_profit_distance = points_needed
            .max(meta.min_stop_distance)
            .round_dp(2)
            .max(meta.min_stop_distance);

        let multiplier = self.stop_to_limit_multiplier.max(Decimal::ONE);
        let stop_loss_distance = (take_profit_distance * multiplier)
            .round_dp(2)
            .max(meta.min_stop_distance);

        let margin = meta.estimated_margin(size);
        if margin > self.margin_budget_eur {
            warn!(
                margin = %margin.round_dp(2),
                budget = %self.margin_budget_eur,
                size = %size,
                "estimated margin exceeds budget at minimum deal size; proceeding anyway"
            );
        }

        debug!(
            size = %size,
            tp = %take_profit_distance,
            sl = %stop_loss_distance,
            margin = %margin.round_dp(2),
            "sizing computed"
        );

        Ok(SizingResult {
            size,
            take_profit_distance,
            stop_loss_distance,
            currency: meta.currency.clone(),
        })
    }
}
