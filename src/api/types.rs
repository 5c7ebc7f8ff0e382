//! Wire types for the IG REST dealing API.
//!
//! IG is inconsistent about numeric encoding: price levels arrive as JSON
//! numbers, but instrument fields like `valueOfOnePip` are strings and
//! `onePipMeans` is prose ("1 Index Point"). The conversion into
//! [`InstrumentMetadata`] normalizes all of that, with the fallbacks the
//! sizing layer expects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::models::{InstrumentMetadata, MarginBand, UnitKind};

/// POST /session body (v2).
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub identifier: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub current_account_id: String,
    #[serde(default)]
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account_id: String,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub preferred: bool,
}

/// PUT /session body (v1), used to switch the active account after login.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchAccountRequest<'a> {
    pub account_id: &'a str,
}

/// GET /markets/{epic} response (v3).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDetails {
    pub instrument: InstrumentData,
    pub dealing_rules: DealingRules,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentData {
    pub epic: String,
    pub name: String,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(rename = "type", default)]
    pub instrument_type: Option<String>,
    #[serde(default)]
    pub currencies: Vec<InstrumentCurrency>,
    /// String-encoded number.
    #[serde(default)]
    pub value_of_one_pip: Option<String>,
    /// Prose like "1 Index Point"; the leading number is the pip size.
    #[serde(default)]
    pub one_pip_means: Option<String>,
    /// String-encoded number.
    #[serde(default)]
    pub contract_size: Option<String>,
    #[serde(default)]
    pub margin_deposit_bands: Vec<MarginDepositBand>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentCurrency {
    pub code: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginDepositBand {
    pub min: Decimal,
    pub max: Option<Decimal>,
    pub margin: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealingRules {
    pub min_deal_size: DealingRuleValue,
    #[serde(default)]
    pub max_deal_size: Option<DealingRuleValue>,
    #[serde(default)]
    pub min_normal_stop_or_limit_distance: Option<DealingRuleValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealingRuleValue {
    #[serde(default)]
    pub unit: Option<String>,
    pub value: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub market_status: Option<String>,
    pub bid: Option<Decimal>,
    pub offer: Option<Decimal>,
}

impl Snapshot {
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.offer) {
            (Some(b), Some(o)) => Some((b + o) / Decimal::TWO),
            (Some(b), None) => Some(b),
            (None, Some(o)) => Some(o),
            (None, None) => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.offer) {
            (Some(b), Some(o)) => Some(o - b),
            _ => None,
        }
    }
}

/// GET /prices/{epic} response (v3).
#[derive(Debug, Clone, Deserialize)]
pub struct PricesResponse {
    pub prices: Vec<PriceBar>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBar {
    #[serde(rename = "snapshotTimeUTC", default)]
    pub snapshot_time_utc: Option<String>,
    pub open_price: PricePoint,
    pub high_price: PricePoint,
    pub low_price: PricePoint,
    pub close_price: PricePoint,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub last_traded: Option<Decimal>,
}

impl PricePoint {
    /// Midpoint of bid/ask, falling back to whichever side exists.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => self.last_traded,
        }
    }
}

impl PriceBar {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.snapshot_time_utc.as_deref()?;
        chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// GET /markets?searchTerm=... response (v1).
#[derive(Debug, Clone, Deserialize)]
pub struct MarketSearchResponse {
    pub markets: Vec<MarketSearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSearchResult {
    pub epic: String,
    pub instrument_name: String,
    #[serde(default)]
    pub instrument_type: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub market_status: Option<String>,
}

/// POST /positions/otc body (v2). Opens when `force_open`, nets off an
/// opposite position of the same size otherwise.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePositionRequest<'a> {
    pub epic: &'a str,
    pub expiry: &'a str,
    pub direction: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
    pub order_type: &'a str,
    pub currency_code: &'a str,
    pub force_open: bool,
    pub guaranteed_stop: bool,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_distance: Option<Decimal>,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit_distance: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealReferenceResponse {
    pub deal_reference: String,
}

/// GET /confirms/{dealReference} response (v1).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealConfirmation {
    #[serde(default)]
    pub deal_id: Option<String>,
    pub deal_status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub level: Option<Decimal>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub profit_currency: Option<String>,
}

impl DealConfirmation {
    pub fn accepted(&self) -> bool {
        self.deal_status.eq_ignore_ascii_case("ACCEPTED")
    }
}

/// PUT /positions/otc/{dealId} body (v2).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmendPositionRequest {
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_level: Option<Decimal>,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit_level: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<bool>,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trailing_stop_distance: Option<Decimal>,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trailing_stop_increment: Option<Decimal>,
}

/// DELETE /positions/otc body (v1).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest<'a> {
    pub deal_id: &'a str,
    pub direction: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
    pub order_type: &'a str,
}

/// GET /positions response (v2).
#[derive(Debug, Clone, Deserialize)]
pub struct PositionsResponse {
    pub positions: Vec<PositionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionEntry {
    pub position: PositionData,
    pub market: PositionMarket,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    pub deal_id: String,
    pub direction: String,
    pub size: Decimal,
    pub level: Decimal,
    #[serde(default)]
    pub stop_level: Option<Decimal>,
    #[serde(default)]
    pub limit_level: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMarket {
    pub epic: String,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub offer: Option<Decimal>,
}

impl PositionMarket {
    /// Expiry for dealing calls against this market. Cash markets report
    /// "-"; dated markets carry their contract expiry.
    pub fn dealing_expiry(&self) -> &str {
        self.expiry.as_deref().unwrap_or("-")
    }
}

/// GET /history/transactions response (v2).
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub instrument_name: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    /// Currency-prefixed amount like "E1.25" or "E-0.80".
    #[serde(default)]
    pub profit_and_loss: Option<String>,
}

impl Transaction {
    /// Strip the currency prefix and parse the signed amount.
    pub fn realized_pnl(&self) -> Option<Decimal> {
        let raw = self.profit_and_loss.as_deref()?;
        let trimmed = raw.trim_start_matches(|c: char| {
            c.is_ascii_alphabetic() || c == '€' || c == '$' || c == '£'
        });
        Decimal::from_str(&trimmed.replace(',', "")).ok()
    }
}

fn parse_leading_number(s: &str) -> Option<Decimal> {
    let numeric: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    Decimal::from_str(&numeric).ok()
}

impl MarketDetails {
    /// Normalize the raw market details into sizing metadata.
    ///
    /// Missing instrument fields degrade to the value that keeps sizing
    /// conservative rather than failing the whole cycle; the degenerate
    /// cases that cannot be sized are rejected downstream.
    pub fn to_metadata(&self) -> InstrumentMetadata {
        let instrument = &self.instrument;

        let value_of_one_pip = instrument
            .value_of_one_pip
            .as_deref()
            .and_then(parse_leading_number)
            .unwrap_or(Decimal::ONE);
        let one_pip_means = instrument
            .one_pip_means
            .as_deref()
            .and_then(parse_leading_number)
            .unwrap_or(Decimal::ONE);
        let contract_size = instrument
            .contract_size
            .as_deref()
            .and_then(parse_leading_number)
            .unwrap_or(Decimal::ONE);

        if instrument.value_of_one_pip.is_none() || instrument.one_pip_means.is_none() {
            warn!(epic = %instrument.epic, "instrument pip fields missing, assuming 1:1");
        }

        let currency = instrument
            .currencies
            .iter()
            .find(|c| c.is_default)
            .or_else(|| instrument.currencies.first())
            .map(|c| c.code.clone())
            .unwrap_or_else(|| "EUR".to_string());

        let margin_bands = instrument
            .margin_deposit_bands
            .iter()
            .map(|band| MarginBand {
                min_notional: band.min,
                max_notional: band.max,
                margin_pct: band.margin,
            })
            .collect();

        let unit = match instrument.unit.as_deref() {
            Some("AMOUNT") => UnitKind::Amount,
            _ => UnitKind::Contracts,
        };

        let tradeable = self
            .snapshot
            .market_status
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case("TRADEABLE"));

        InstrumentMetadata {
            epic: instrument.epic.clone(),
            name: instrument.name.clone(),
            currency,
            value_of_one_pip,
            one_pip_means,
            contract_size,
            min_deal_size: self.dealing_rules.min_deal_size.value,
            max_deal_size: self
                .dealing_rules
                .max_deal_size
                .as_ref()
                .map(|r| r.value)
                .unwrap_or(Decimal::MAX),
            min_stop_distance: self
                .dealing_rules
                .min_normal_stop_or_limit_distance
                .as_ref()
                .map(|r| r.value)
                .unwrap_or(Decimal::ZERO),
            margin_bands,
            unit,
            tradeable,
            snapshot_price: self.snapshot.mid().unwrap_or(Decimal::ZERO),
        }
    }

    /// Expiry string for dealing requests. Cash CFDs carry "-"; dated
    /// markets keep their own expiry.
    pub fn dealing_expiry(&self) -> &str {
        match self.instrument.expiry.as_deref() {
            Some(e) if !e.is_empty() => e,
            None | Some(_) => "-",
        }
    }
}
