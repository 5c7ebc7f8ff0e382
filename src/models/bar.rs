//! Price bar and quote models derived from IG candle data.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// One completed OHLC bar at the working resolution (1 minute), mid prices.
///
/// Bars are always handled oldest-first; the last element of a slice is the
/// most recently completed bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Bar {
    /// True range against the previous bar's close.
    pub fn true_range(&self, prev_close: Decimal) -> Decimal {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}

/// Latest mid price and bid/ask spread, taken from the most recent bar's
/// close. Spread is `None` when the feed omits one side of the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub mid: Decimal,
    pub spread: Option<Decimal>,
}
