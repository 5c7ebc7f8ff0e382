//! Instrument metadata needed for sizing and stop placement.
//!
//! Re-fetched fresh from the market-details endpoint before every sizing
//! computation; never cached across trades.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// How deal size is denominated for this instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Contracts,
    Amount,
}

/// One margin deposit band: the margin percentage applicable while the
/// position notional falls inside `[min_notional, max_notional)`.
#[derive(Debug, Clone)]
pub struct MarginBand {
    pub min_notional: Decimal,
    pub max_notional: Option<Decimal>,
    /// Margin requirement as a percentage (e.g. 5 means 5%).
    pub margin_pct: Decimal,
}

/// Everything sizing and trade management need to know about the instrument.
#[derive(Debug, Clone)]
pub struct InstrumentMetadata {
    pub epic: String,
    pub name: String,
    pub currency: String,
    /// Monetary value of a one-pip move for one unit of size.
    pub value_of_one_pip: Decimal,
    /// Points per pip (IG's `onePipMeans`).
    pub one_pip_means: Decimal,
    pub contract_size: Decimal,
    pub min_deal_size: Decimal,
    pub max_deal_size: Decimal,
    /// `minNormalStopOrLimitDistance`, in points.
    pub min_stop_distance: Decimal,
    pub margin_bands: Vec<MarginBand>,
    pub unit: UnitKind,
    /// Whether the market status currently permits dealing.
    pub tradeable: bool,
    /// Latest offer/bid snapshot price, used for margin estimation.
    pub snapshot_price: Decimal,
}

impl InstrumentMetadata {
    /// Margin rate (fraction, not percent) for a given notional exposure.
    ///
    /// Falls back to the first band, then to a conservative 5%, when the
    /// notional matches no band.
    pub fn margin_rate_for(&self, notional: Decimal) -> Decimal {
        for band in &self.margin_bands {
            let above = notional >= band.min_notional;
            let below = band.max_notional.map_or(true, |max| notional < max);
            if above && below {
                return band.margin_pct / dec!(100);
            }
        }
        self.margin_bands
            .first()
            .map(|b| b.margin_pct / dec!(100))
            .unwrap_or(dec!(0.05))
    }

    /// Notional exposure for a deal of `size` units at the snapshot price.
    pub fn notional(&self, size: Decimal) -> Decimal {
        self.snapshot_price * size * self.contract_size
    }

    /// Estimated margin requirement for a deal of `size` units.
    pub fn estimated_margin(&self, size: Decimal) -> Decimal {
        let notional = self.notional(size);
        notional * self.margin_rate_for(notional)
    }

    /// Convert a move in points to account currency for a deal of `size`.
    pub fn points_to_currency(&self, points: Decimal, size: Decimal) -> Decimal {
        if self.one_pip_means.is_zero() {
            return Decimal::ZERO;
        }
        points / self.one_pip_means * self.value_of_one_pip * size
    }
}
