//! Running totals for one bot session. In-memory only, never persisted.

use rust_decimal::Decimal;

/// Approximate realized outcome of the session so far.
///
/// A favorable close is credited the per-trade target amount; other closes
/// credit nothing. This is the loop-termination estimate, not an accounting
/// ledger.
#[derive(Debug, Clone, Default)]
pub struct SessionTotals {
    pub realized_estimate_eur: Decimal,
    pub trade_count: u32,
}

impl SessionTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished trade.
    pub fn record_close(&mut self, favorable: bool, per_trade_target_eur: Decimal) {
        self.trade_count += 1;
        if favorable {
            self.realized_estimate_eur += per_trade_target_eur;
        }
    }

    /// Loop predicate: has the daily target been reached?
    pub fn target_reached(&self, daily_target_eur: Decimal) -> bool {
        self.realized_estimate_eur >= daily_target_eur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ten_favorable_closes_reach_ten_euro_target() {
        let mut totals = SessionTotals::new();
        for _ in 0..9 {
            totals.record_close(true, dec!(1));
            assert!(!totals.target_reached(dec!(10)));
        }
        totals.record_close(true, dec!(1));
        assert!(totals.target_reached(dec!(10)));
        assert_eq!(totals.trade_count, 10);
    }

    #[test]
    fn unfavorable_closes_count_trades_but_not_progress() {
        let mut totals = SessionTotals::new();
        totals.record_close(false, dec!(1));
        totals.record_close(false, dec!(1));
        assert_eq!(totals.trade_count, 2);
        assert_eq!(totals.realized_estimate_eur, dec!(0));
        assert!(!totals.target_reached(dec!(10)));
    }
}
