//! IG REST dealing client.
//!
//! Handles:
//! - session creation and the CST / X-SECURITY-TOKEN header pair
//! - transparent re-login when a token expires mid-session (401)
//! - market details, minute bars, positions, dealing and transaction history
//! - quota accounting for every request issued
//!
//! Read paths retry transient failures with exponential backoff. Dealing
//! calls never blind-retry: a timed-out open may still have filled, so the
//! caller reconciles through the positions list instead.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Bar, Direction, InstrumentMetadata};

use super::quota::{QuotaTracker, RequestKind};
use super::types::*;

pub const LIVE_API_URL: &str = "https://api.ig.com/gateway/deal";
pub const DEMO_API_URL: &str = "https://demo-api.ig.com/gateway/deal";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(20);

const GERMANY40_SEARCH_TERMS: &[&str] = &["Germany 40", "Germany40", "DAX", "GER40", "DE40"];
const GERMANY40_NAME_KEYWORDS: &[&str] = &["germany 40", "dax", "ger40", "de40"];
// Region-dependent; used only when every search comes back empty.
const GERMANY40_FALLBACK_EPIC: &str = "IX.D.DAX.IFMM.IP";

#[derive(Debug, Error)]
pub enum DealingError {
    #[error("login rejected: {0}")]
    LoginFailed(String),
    #[error("session tokens missing from login response")]
    MissingTokens,
    #[error("session expired and re-login failed: {0}")]
    AuthRefresh(String),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("deal rejected: {0}")]
    DealRejected(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl DealingError {
    /// Worth retrying: transport hiccups and server-side errors. Auth and
    /// validation failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DealingError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            DealingError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Credentials and environment selection for one IG account.
#[derive(Debug, Clone)]
pub struct IgCredentials {
    pub api_key: String,
    pub username: String,
    pub password: String,
    pub account_id: Option<String>,
    pub demo: bool,
}

#[derive(Debug, Clone)]
struct SessionTokens {
    cst: String,
    security_token: String,
}

pub struct IgClient {
    http: Client,
    base_url: String,
    credentials: IgCredentials,
    tokens: Mutex<Option<SessionTokens>>,
    quota: Mutex<QuotaTracker>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(RETRY_MAX_ELAPSED),
        ..ExponentialBackoff::default()
    }
}

async fn with_retry<T, F, Fut>(operation: F) -> Result<T, DealingError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DealingError>>,
{
    let mut operation = operation;
    backoff::future::retry(retry_policy(), || {
        let fut = operation();
        async {
            fut.await.map_err(|e| {
                if e.is_transient() {
                    warn!(error = %e, "transient api error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

/// A Germany 40 market that passed the type and name filters, reduced to
/// the fields the epic ranking compares.
#[derive(Debug, Clone)]
struct EpicCandidate {
    epic: String,
    contract_size: Decimal,
    margin_rate: Decimal,
}

fn germany40_candidate(
    market: &MarketSearchResult,
    meta: &InstrumentMetadata,
) -> Option<EpicCandidate> {
    let kind = market.instrument_type.as_deref().unwrap_or("");
    if !kind.eq_ignore_ascii_case("INDICES") && !kind.eq_ignore_ascii_case("INDEX") {
        return None;
    }
    let name = meta.name.to_lowercase();
    if !GERMANY40_NAME_KEYWORDS.iter().any(|k| name.contains(k)) {
        return None;
    }
    Some(EpicCandidate {
        epic: meta.epic.clone(),
        contract_size: meta.contract_size,
        // First-band rate; zero notional always lands in the lowest band.
        margin_rate: meta.margin_rate_for(Decimal::ZERO),
    })
}

/// Smallest contract size wins, lowest margin rate breaks ties.
fn pick_smallest_contract(mut candidates: Vec<EpicCandidate>) -> Option<EpicCandidate> {
    candidates.sort_by(|a, b| {
        (a.contract_size, a.margin_rate).cmp(&(b.contract_size, b.margin_rate))
    });
    candidates.into_iter().next()
}

impl IgClient {
    pub fn new(credentials: IgCredentials) -> Result<Self, DealingError> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let base_url = if credentials.demo {
            DEMO_API_URL.to_string()
        } else {
            LIVE_API_URL.to_string()
        };
        Ok(Self {
            http,
            base_url,
            credentials,
            tokens: Mutex::new(None),
            quota: Mutex::new(QuotaTracker::new()),
        })
    }

    /// Create the dealing session and capture the token pair. Switches to
    /// the configured account when the login lands on a different one.
    pub async fn login(&self) -> Result<(), DealingError> {
        lock(&self.quota).record(RequestKind::Auth);

        let body = LoginRequest {
            identifier: &self.credentials.username,
            password: &self.credentials.password,
        };
        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .headers(self.base_headers(2)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DealingError::LoginFailed(format!("{status}: {text}")));
        }

        let cst = header_string(response.headers(), "CST");
        let security_token = header_string(response.headers(), "X-SECURITY-TOKEN");
        let (Some(cst), Some(security_token)) = (cst, security_token) else {
            return Err(DealingError::MissingTokens);
        };
        *lock(&self.tokens) = Some(SessionTokens {
            cst,
            security_token,
        });

        let session: SessionResponse = response.json().await?;
        info!(account = %session.current_account_id, "logged in");

        if let Some(wanted) = self.credentials.account_id.as_deref() {
            if wanted != session.current_account_id {
                self.switch_account(wanted).await?;
            }
        }
        Ok(())
    }

    async fn switch_account(&self, account_id: &str) -> Result<(), DealingError> {
        info!(%account_id, "switching active account");
        let body = SwitchAccountRequest { account_id };
        self.request_json::<_, serde_json::Value>(
            Method::PUT,
            "/session",
            1,
            Some(&body),
            RequestKind::Auth,
        )
        .await?;
        Ok(())
    }

    /// End the session server-side. Token loss afterwards is expected.
    pub async fn logout(&self) -> Result<(), DealingError> {
        let response = self
            .request_raw(Method::DELETE, "/session", 1, None::<&()>, RequestKind::Auth)
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::UNAUTHORIZED {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DealingError::Api { status, body });
        }
        *lock(&self.tokens) = None;
        Ok(())
    }

    pub async fn market_details(&self, epic: &str) -> Result<MarketDetails, DealingError> {
        let path = format!("/markets/{epic}");
        with_retry(|| {
            self.request_json::<(), MarketDetails>(
                Method::GET,
                &path,
                3,
                None,
                RequestKind::Data,
            )
        })
        .await
    }

    /// Latest completed minute bars, oldest first. Bars missing a usable
    /// price on any leg are dropped.
    pub async fn recent_bars(&self, epic: &str, max: usize) -> Result<Vec<Bar>, DealingError> {
        let path = format!("/prices/{epic}?resolution=MINUTE&max={max}");
        let response: PricesResponse = with_retry(|| {
            self.request_json::<(), PricesResponse>(
                Method::GET,
                &path,
                3,
                None,
                RequestKind::Data,
            )
        })
        .await?;
        lock(&self.quota).record_history_points(response.prices.len() as u64);

        let mut bars = Vec::with_capacity(response.prices.len());
        for price in &response.prices {
            let (Some(timestamp), Some(open), Some(high), Some(low), Some(close)) = (
                price.timestamp(),
                price.open_price.mid(),
                price.high_price.mid(),
                price.low_price.mid(),
                price.close_price.mid(),
            ) else {
                debug!("dropping incomplete price bar");
                continue;
            };
            bars.push(Bar {
                timestamp,
                open,
                high,
                low,
                close,
            });
        }
        Ok(bars)
    }

    pub async fn search_markets(
        &self,
        term: &str,
    ) -> Result<Vec<MarketSearchResult>, DealingError> {
        let path = format!("/markets?searchTerm={}", urlencode(term));
        let response: MarketSearchResponse = with_retry(|| {
            self.request_json::<(), MarketSearchResponse>(
                Method::GET,
                &path,
                1,
                None,
                RequestKind::Data,
            )
        })
        .await?;
        Ok(response.markets)
    }

    /// Find a dealable Germany 40 index epic, preferring the contract with
    /// the smallest contract size (Micro before Mini before full-size) and
    /// the lowest first-band margin rate as tie-break. Every search term is
    /// tried and each candidate's details are fetched so the ranking reads
    /// the real contract size, not search order.
    pub async fn choose_germany40_epic(&self) -> Result<String, DealingError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for term in GERMANY40_SEARCH_TERMS {
            let markets = match self.search_markets(term).await {
                Ok(markets) => markets,
                Err(e) => {
                    warn!(term, error = %e, "market search failed");
                    continue;
                }
            };
            for market in markets {
                if !seen.insert(market.epic.clone()) {
                    continue;
                }
                let details = match self.market_details(&market.epic).await {
                    Ok(details) => details,
                    Err(e) => {
                        debug!(epic = %market.epic, error = %e, "details fetch failed");
                        continue;
                    }
                };
                if let Some(candidate) =
                    germany40_candidate(&market, &details.to_metadata())
                {
                    candidates.push(candidate);
                }
            }
        }

        match pick_smallest_contract(candidates) {
            Some(best) => {
                info!(
                    epic = %best.epic,
                    contract_size = %best.contract_size,
                    "resolved epic"
                );
                Ok(best.epic)
            }
            None => {
                warn!(epic = GERMANY40_FALLBACK_EPIC, "no Germany 40 candidate, using fallback");
                Ok(GERMANY40_FALLBACK_EPIC.to_string())
            }
        }
    }

    /// Open a market position with attached stop and limit distances, then
    /// confirm the deal reference. A rejection surfaces as `DealRejected`.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        epic: &str,
        expiry: &str,
        direction: Direction,
        size: Decimal,
        currency: &str,
        stop_distance: Decimal,
        limit_distance: Decimal,
    ) -> Result<DealConfirmation, DealingError> {
        let body = CreatePositionRequest {
            epic,
            expiry,
            direction: direction.as_str(),
            size,
            order_type: "MARKET",
            currency_code: currency,
            force_open: true,
            guaranteed_stop: false,
            stop_distance: Some(stop_distance),
            limit_distance: Some(limit_distance),
        };
        let reference: DealReferenceResponse = self
            .request_json(
                Method::POST,
                "/positions/otc",
                2,
                Some(&body),
                RequestKind::Trade,
            )
            .await?;
        self.confirm(&reference.deal_reference).await
    }

    pub async fn confirm(&self, deal_reference: &str) -> Result<DealConfirmation, DealingError> {
        let path = format!("/confirms/{deal_reference}");
        let confirmation: DealConfirmation = self
            .request_json::<(), _>(Method::GET, &path, 1, None, RequestKind::Trade)
            .await?;
        if !confirmation.accepted() {
            return Err(DealingError::DealRejected(
                confirmation
                    .reason
                    .unwrap_or_else(|| confirmation.deal_status.clone()),
            ));
        }
        Ok(confirmation)
    }

    pub async fn list_positions(&self) -> Result<Vec<PositionEntry>, DealingError> {
        let response: PositionsResponse = with_retry(|| {
            self.request_json::<(), PositionsResponse>(
                Method::GET,
                "/positions",
                2,
                None,
                RequestKind::Trade,
            )
        })
        .await?;
        Ok(response.positions)
    }

    pub async fn amend_position(
        &self,
        deal_id: &str,
        body: &AmendPositionRequest,
    ) -> Result<(), DealingError> {
        let path = format!("/positions/otc/{deal_id}");
        self.request_json::<_, serde_json::Value>(
            Method::PUT,
            &path,
            2,
            Some(body),
            RequestKind::Trade,
        )
        .await?;
        Ok(())
    }

    /// Close an open position at market.
    ///
    /// Preferred route is a netting-off order (same size, opposite
    /// direction, `forceOpen=false`). If that is rejected, fall back to the
    /// close endpoint, first as a bodied DELETE and then through the
    /// method-override header some gateways require.
    pub async fn close_position(
        &self,
        epic: &str,
        expiry: &str,
        deal_id: &str,
        direction: Direction,
        size: Decimal,
        currency: &str,
    ) -> Result<DealConfirmation, DealingError> {
        let net_off = CreatePositionRequest {
            epic,
            expiry,
            direction: direction.opposite().as_str(),
            size,
            order_type: "MARKET",
            currency_code: currency,
            force_open: false,
            guaranteed_stop: false,
            stop_distance: None,
            limit_distance: None,
        };
        match self
            .request_json::<_, DealReferenceResponse>(
                Method::POST,
                "/positions/otc",
                2,
                Some(&net_off),
                RequestKind::Trade,
            )
            .await
        {
            Ok(reference) => return self.confirm(&reference.deal_reference).await,
            Err(e) if !e.is_transient() => {
                warn!(error = %e, "net-off close rejected, trying close endpoint");
            }
            Err(e) => return Err(e),
        }

        let close = ClosePositionRequest {
            deal_id,
            direction: direction.opposite().as_str(),
            size,
            order_type: "MARKET",
        };
        match self
            .request_json::<_, DealReferenceResponse>(
                Method::DELETE,
                "/positions/otc",
                1,
                Some(&close),
                RequestKind::Trade,
            )
            .await
        {
            Ok(reference) => return self.confirm(&reference.deal_reference).await,
            Err(e) if !e.is_transient() => {
                warn!(error = %e, "bodied delete rejected, trying method override");
            }
            Err(e) => return Err(e),
        }

        let response = self
            .request_with_headers(
                Method::POST,
                "/positions/otc",
                1,
                Some(&close),
                RequestKind::Trade,
                Some(("_method", "DELETE")),
            )
            .await?;
        let reference: DealReferenceResponse = deserialize_response(response).await?;
        self.confirm(&reference.deal_reference).await
    }

    /// Deal transactions since `from`, newest first as IG returns them.
    pub async fn recent_transactions(
        &self,
        from: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DealingError> {
        let path = format!(
            "/history/transactions?type=ALL_DEAL&from={}",
            from.format("%Y-%m-%dT%H:%M:%S")
        );
        let response: TransactionsResponse = with_retry(|| {
            self.request_json::<(), TransactionsResponse>(
                Method::GET,
                &path,
                2,
                None,
                RequestKind::Data,
            )
        })
        .await?;
        Ok(response.transactions)
    }

    /// Periodic quota log line, rate-limited internally.
    pub fn report_quota(&self) {
        lock(&self.quota).maybe_report();
    }

    async fn request_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        version: u8,
        body: Option<&B>,
        kind: RequestKind,
    ) -> Result<T, DealingError> {
        let response = self.request_raw(method, path, version, body, kind).await?;
        deserialize_response(response).await
    }

    async fn request_raw<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        version: u8,
        body: Option<&B>,
        kind: RequestKind,
    ) -> Result<reqwest::Response, DealingError> {
        self.request_with_headers(method, path, version, body, kind, None)
            .await
    }

    /// Issue one authenticated request, re-creating the session once on 401.
    async fn request_with_headers<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        version: u8,
        body: Option<&B>,
        kind: RequestKind,
        extra: Option<(&'static str, &'static str)>,
    ) -> Result<reqwest::Response, DealingError> {
        lock(&self.quota).record(kind);

        let response = self
            .send_once(method.clone(), path, version, body, extra)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(%path, "session token rejected, re-authenticating");
        Box::pin(self.login())
            .await
            .map_err(|e| DealingError::AuthRefresh(e.to_string()))?;
        lock(&self.quota).record(kind);
        self.send_once(method, path, version, body, extra).await
    }

    async fn send_once<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        version: u8,
        body: Option<&B>,
        extra: Option<(&'static str, &'static str)>,
    ) -> Result<reqwest::Response, DealingError> {
        let mut headers = self.base_headers(version)?;
        if let Some(tokens) = lock(&self.tokens).as_ref() {
            headers.insert(
                HeaderName::from_static("cst"),
                header_value(&tokens.cst)?,
            );
            headers.insert(
                HeaderName::from_static("x-security-token"),
                header_value(&tokens.security_token)?,
            );
        }
        if let Some((name, value)) = extra {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    fn base_headers(&self, version: u8) -> Result<HeaderMap, DealingError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-ig-api-key"),
            header_value(&self.credentials.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("version"),
            header_value(&version.to_string())?,
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DealingError> {
    HeaderValue::from_str(value).map_err(|_| DealingError::MissingTokens)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn deserialize_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, DealingError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DealingError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

fn urlencode(s: &str) -> String {
    s.replace(' ', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let server = DealingError::Api {
            status: 503,
            body: String::new(),
        };
        assert!(server.is_transient());

        let client = DealingError::Api {
            status: 400,
            body: String::new(),
        };
        assert!(!client.is_transient());

        assert!(!DealingError::DealRejected("INSUFFICIENT_FUNDS".into()).is_transient());
        assert!(!DealingError::MissingTokens.is_transient());
    }

    #[test]
    fn demo_flag_selects_base_url() {
        let credentials = IgCredentials {
            api_key: "key".into(),
            username: "user".into(),
            password: "pass".into(),
            account_id: None,
            demo: true,
        };
        let client = IgClient::new(credentials).unwrap();
        assert_eq!(client.base_url, DEMO_API_URL);
    }

    #[test]
    fn urlencode_escapes_spaces() {
        assert_eq!(urlencode("Germany 40"), "Germany%2040");
    }

    use crate::models::{MarginBand, UnitKind};
    use rust_decimal_macros::dec;

    fn search_result(epic: &str, instrument_type: Option<&str>) -> MarketSearchResult {
        MarketSearchResult {
            epic: epic.to_string(),
            instrument_name: String::new(),
            instrument_type: instrument_type.map(str::to_string),
            expiry: None,
            market_status: Some("TRADEABLE".to_string()),
        }
    }

    fn metadata(epic: &str, name: &str, contract_size: Decimal) -> InstrumentMetadata {
        InstrumentMetadata {
            epic: epic.to_string(),
            name: name.to_string(),
            currency: "EUR".to_string(),
            value_of_one_pip: dec!(1),
            one_pip_means: dec!(1),
            contract_size,
            min_deal_size: dec!(0.5),
            max_deal_size: dec!(100),
            min_stop_distance: dec!(1),
            margin_bands: vec![MarginBand {
                min_notional: dec!(0),
                max_notional: None,
                margin_pct: dec!(5),
            }],
            unit: UnitKind::Contracts,
            tradeable: true,
            snapshot_price: dec!(20000),
        }
    }

    #[test]
    fn candidate_filter_requires_index_type_and_name() {
        let meta = metadata("IX.D.DAX.IFMM.IP", "Germany 40 Cash", dec!(1));

        assert!(germany40_candidate(&search_result("IX.D.DAX.IFMM.IP", Some("INDICES")), &meta)
            .is_some());
        assert!(germany40_candidate(&search_result("IX.D.DAX.IFMM.IP", Some("INDEX")), &meta)
            .is_some());
        assert!(germany40_candidate(&search_result("IX.D.DAX.IFMM.IP", Some("SHARES")), &meta)
            .is_none());
        assert!(germany40_candidate(&search_result("IX.D.DAX.IFMM.IP", None), &meta).is_none());

        let unrelated = metadata("IX.D.SPTRD.IFMM.IP", "US 500 Cash", dec!(1));
        assert!(
            germany40_candidate(&search_result("IX.D.SPTRD.IFMM.IP", Some("INDICES")), &unrelated)
                .is_none()
        );
    }

    #[test]
    fn smallest_contract_size_wins_regardless_of_search_order() {
        let full = germany40_candidate(
            &search_result("IX.D.DAX.IFD.IP", Some("INDICES")),
            &metadata("IX.D.DAX.IFD.IP", "Germany 40", dec!(25)),
        )
        .unwrap();
        let mini = germany40_candidate(
            &search_result("IX.D.DAX.IFMM.IP", Some("INDICES")),
            &metadata("IX.D.DAX.IFMM.IP", "Germany 40 Mini", dec!(5)),
        )
        .unwrap();

        // Full-size contract listed first in the search response.
        let best = pick_smallest_contract(vec![full, mini]).unwrap();
        assert_eq!(best.epic, "IX.D.DAX.IFMM.IP");
        assert_eq!(best.contract_size, dec!(5));
    }

    #[test]
    fn margin_rate_breaks_contract_size_ties() {
        let cheap = germany40_candidate(
            &search_result("IX.D.DAX.CHEAP.IP", Some("INDICES")),
            &metadata("IX.D.DAX.CHEAP.IP", "Germany 40", dec!(1)),
        )
        .unwrap();
        let mut expensive_meta = metadata("IX.D.DAX.DEAR.IP", "Germany 40", dec!(1));
        expensive_meta.margin_bands[0].margin_pct = dec!(20);
        let expensive = germany40_candidate(
            &search_result("IX.D.DAX.DEAR.IP", Some("INDICES")),
            &expensive_meta,
        )
        .unwrap();

        let best = pick_smallest_contract(vec![expensive, cheap]).unwrap();
        assert_eq!(best.epic, "IX.D.DAX.CHEAP.IP");
    }

    #[test]
    fn no_candidates_yields_none() {
        assert!(pick_smallest_contract(Vec::new()).is_none());
    }
}
