//! Bot runner: the session orchestration loop.
//!
//! Handles:
//! - Session login, epic resolution and teardown
//! - Gating new entries on session windows, volatility and spread
//! - Opening one position at a time with attached stop and limit
//! - Managing the open position tick by tick until it closes
//! - Stopping for the day once the profit target estimate is reached

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::api::types::{AmendPositionRequest, PositionEntry};
use crate::api::{DealingError, IgClient, IgCredentials};
use crate::models::{Direction, Quote, SessionTotals};
use crate::trading::{
    CloseReason, DirectionStrategy, EntryDecision, EntryGate, OpenPosition, SessionConfig,
    SignalKind, SizingCalculator, StopUpdate, StrategyConfig, TickDecision, TradeManager,
    TradingConfig,
};

/// Dealing-close attempts before a close is abandoned.
const CLOSE_ATTEMPTS: u32 = 3;

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Epic to trade; resolved by market search when absent.
    pub epic: Option<String>,

    /// Log intents without issuing dealing calls.
    pub dry_run: bool,

    pub trading: TradingConfig,
    pub signal: SignalKind,
    pub strategy: StrategyConfig,
    pub session: SessionConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            epic: None,
            dry_run: true,
            trading: TradingConfig::default(),
            signal: SignalKind::MicroMomentum,
            strategy: StrategyConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// How one managed trade ended.
#[derive(Debug)]
enum TradeOutcome {
    Closed(CloseReason),
    Interrupted,
}

/// Main bot runner. Drives exactly one position at a time.
pub struct Bot {
    config: BotConfig,
    client: IgClient,
    entry_gate: EntryGate,
    sizing: SizingCalculator,
    totals: SessionTotals,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(config: BotConfig, credentials: IgCredentials) -> Result<Self> {
        let client = IgClient::new(credentials).context("failed to build IG client")?;
        let strategy = DirectionStrategy::new(config.signal, config.strategy.clone());
        let entry_gate = EntryGate::new(&config.trading, strategy);
        let sizing = SizingCalculator::new(
            config.trading.per_trade_target_eur,
            config.trading.margin_budget_eur,
            config.trading.stop_to_limit_multiplier,
        );
        Ok(Self {
            config,
            client,
            entry_gate,
            sizing,
            totals: SessionTotals::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Main run loop. Returns after the daily target, a shutdown signal, or
    /// a fatal session error; always attempts teardown.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            signal = self.entry_gate.strategy().kind().as_str(),
            windows = %self.config.session.describe(),
            "starting session"
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.client.login().await.context("login failed")?;

        let result = self.trade_loop().await;

        if let Err(e) = self.teardown().await {
            warn!(error = %e, "teardown incomplete");
        }
        result
    }

    async fn trade_loop(&mut self) -> Result<()> {
        let epic = match self.config.epic.clone() {
            Some(epic) => epic,
            None => self
                .client
                .choose_germany40_epic()
                .await
                .context("epic discovery failed")?,
        };
        info!(%epic, "trading");

        while !self.shutting_down() {
            self.client.report_quota();

            if self
                .totals
                .target_reached(self.config.trading.daily_target_eur)
            {
                info!(
                    realized = %self.totals.realized_estimate_eur,
                    trades = self.totals.trade_count,
                    "daily target reached, stopping"
                );
                break;
            }

            if !self.config.session.in_session(Utc::now()) {
                debug!("outside session window");
                self.idle(self.config.trading.session_idle_sleep_secs).await;
                continue;
            }

            match self.trade_cycle(&epic).await {
                Ok(Some(TradeOutcome::Closed(reason))) => {
                    self.totals.record_close(
                        reason.is_favorable(),
                        self.config.trading.per_trade_target_eur,
                    );
                    info!(
                        reason = reason.as_str(),
                        realized = %self.totals.realized_estimate_eur,
                        trades = self.totals.trade_count,
                        "trade closed"
                    );
                }
                Ok(Some(TradeOutcome::Interrupted)) => break,
                Ok(None) => {
                    self.idle(self.config.trading.poll_positions_secs).await;
                }
                Err(e) => {
                    error!(error = %e, "trade cycle failed");
                    self.idle(self.config.trading.retry_backoff_secs).await;
                }
            }
        }
        Ok(())
    }

    /// Attempt one full trade: gate, size, open, then manage to the end.
    /// `None` means no entry this cycle.
    async fn trade_cycle(&mut self, epic: &str) -> Result<Option<TradeOutcome>> {
        let details = self.client.market_details(epic).await?;
        let meta = details.to_metadata();
        if !meta.tradeable {
            debug!("market not tradeable");
            return Ok(None);
        }

        let bars_needed = self
            .entry_gate
            .strategy()
            .bars_needed()
            .max(self.config.trading.atr_period + 1);
        let bars = self.client.recent_bars(epic, bars_needed).await?;

        let spread = details.snapshot.spread();
        let direction = match self.entry_gate.evaluate(&bars, spread) {
            EntryDecision::Enter(direction) => direction,
            EntryDecision::Skip(reason) => {
                debug!(%reason, "no entry");
                return Ok(None);
            }
        };

        let sizing = self.sizing.compute(&meta)?;
        info!(
            %direction,
            size = %sizing.size,
            tp = %sizing.take_profit_distance,
            sl = %sizing.stop_loss_distance,
            "entry signal"
        );

        if self.config.dry_run {
            info!(
                %direction,
                size = %sizing.size,
                "[DRY RUN] would open position"
            );
            return Ok(None);
        }

        let expiry = details.dealing_expiry().to_string();
        let confirmation = self
            .client
            .open_position(
                epic,
                &expiry,
                direction,
                sizing.size,
                &sizing.currency,
                sizing.stop_loss_distance,
                sizing.take_profit_distance,
            )
            .await?;

        let deal_id = confirmation
            .deal_id
            .context("accepted deal missing a deal id")?;
        let entry_level = match confirmation.level {
            Some(level) => level,
            None => self
                .find_position(&deal_id)
                .await?
                .map(|p| p.position.level)
                .context("opened position not found")?,
        };

        let (stop_level, limit_level) = match direction {
            Direction::Buy => (
                entry_level - sizing.stop_loss_distance,
                entry_level + sizing.take_profit_distance,
            ),
            Direction::Sell => (
                entry_level + sizing.stop_loss_distance,
                entry_level - sizing.take_profit_distance,
            ),
        };
        let position = OpenPosition {
            deal_id,
            direction,
            entry_level,
            size: sizing.size,
            stop_level,
            limit_level,
        };
        info!(
            deal_id = %position.deal_id,
            entry = %position.entry_level,
            stop = %position.stop_level,
            limit = %position.limit_level,
            "position opened"
        );

        let manager = TradeManager::new(
            &self.config.trading,
            position,
            sizing.take_profit_distance,
            meta.min_stop_distance,
        );
        let outcome = self
            .manage_position(epic, &expiry, &sizing.currency, manager)
            .await?;
        Ok(Some(outcome))
    }

    /// Poll the open position until it closes, amending the stop as the
    /// manager directs. Failed amendments are retried on the next tick.
    async fn manage_position(
        &mut self,
        epic: &str,
        expiry: &str,
        currency: &str,
        mut manager: TradeManager,
    ) -> Result<TradeOutcome> {
        let opened_at = Utc::now();
        let bars_needed = (self.config.trading.ema_period + 1)
            .max(self.config.trading.atr_period + 1);

        loop {
            if self.shutting_down() {
                info!("shutdown during open trade, closing position");
                self.close_managed(epic, expiry, currency, &manager).await;
                return Ok(TradeOutcome::Interrupted);
            }
            sleep(Duration::from_secs(self.config.trading.poll_positions_secs)).await;

            let deal_id = manager.position().deal_id.clone();
            let entry = match self.find_position(&deal_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    let pnl = self.lookup_realized_pnl(opened_at).await;
                    let reason = manager.on_external_exit(pnl);
                    info!(pnl = ?pnl, "position closed broker-side");
                    return Ok(TradeOutcome::Closed(reason));
                }
                Err(e) => {
                    warn!(error = %e, "position poll failed");
                    continue;
                }
            };

            let bars = match self.client.recent_bars(epic, bars_needed).await {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(error = %e, "bar refresh failed");
                    continue;
                }
            };
            let Some(quote) = quote_from_entry(&entry) else {
                debug!("no usable quote on position market");
                continue;
            };

            match manager.on_tick(&bars, &quote) {
                TickDecision::Hold => {}
                TickDecision::UpdateStop(update) => {
                    self.apply_stop_update(&mut manager, &deal_id, update).await;
                }
                TickDecision::Close {
                    reason,
                    move_points,
                } => {
                    info!(
                        reason = reason.as_str(),
                        %move_points,
                        "closing position"
                    );
                    self.close_managed(epic, expiry, currency, &manager).await;
                    return Ok(TradeOutcome::Closed(reason));
                }
            }
        }
    }

    async fn apply_stop_update(
        &self,
        manager: &mut TradeManager,
        deal_id: &str,
        update: StopUpdate,
    ) {
        let body = AmendPositionRequest {
            stop_level: Some(update.stop_level),
            limit_level: None,
            trailing_stop: update.trailing.map(|_| true),
            trailing_stop_distance: update.trailing.map(|t| t.distance),
            trailing_stop_increment: update.trailing.map(|t| t.step),
        };
        match self.client.amend_position(deal_id, &body).await {
            Ok(()) => {
                info!(
                    stop = %update.stop_level,
                    armed = update.arms_breakeven,
                    trailing = update.trailing.is_some(),
                    "stop amended"
                );
                manager.confirm_stop_update(&update);
            }
            Err(e) => {
                warn!(error = %e, "stop amendment failed, retrying next tick");
            }
        }
    }

    async fn close_managed(
        &self,
        epic: &str,
        expiry: &str,
        currency: &str,
        manager: &TradeManager,
    ) {
        let position = manager.position();
        self.close_with_retries(
            epic,
            expiry,
            &position.deal_id,
            position.direction,
            position.size,
            currency,
        )
        .await;
    }

    /// Issue a close, retrying a few times before giving up. An abandoned
    /// close leaves the position protected by its resting stop, so this is
    /// loud but not fatal.
    async fn close_with_retries(
        &self,
        epic: &str,
        expiry: &str,
        deal_id: &str,
        direction: Direction,
        size: Decimal,
        currency: &str,
    ) -> bool {
        for attempt in 1..=CLOSE_ATTEMPTS {
            match self
                .client
                .close_position(epic, expiry, deal_id, direction, size, currency)
                .await
            {
                Ok(_) => {
                    info!(%deal_id, "position closed");
                    return true;
                }
                Err(e) if attempt < CLOSE_ATTEMPTS => {
                    warn!(error = %e, %deal_id, attempt, "close failed, retrying");
                    sleep(Duration::from_secs(self.config.trading.retry_backoff_secs)).await;
                }
                Err(e) => {
                    error!(error = %e, %deal_id, "close abandoned after {CLOSE_ATTEMPTS} attempts");
                }
            }
        }
        false
    }

    async fn find_position(&self, deal_id: &str) -> Result<Option<PositionEntry>, DealingError> {
        let positions = self.client.list_positions().await?;
        Ok(positions
            .into_iter()
            .find(|p| p.position.deal_id == deal_id))
    }

    /// Realized P&L of the most recent deal transaction since `since`.
    async fn lookup_realized_pnl(&self, since: DateTime<Utc>) -> Option<Decimal> {
        match self.client.recent_transactions(since).await {
            Ok(transactions) => transactions.iter().find_map(|t| t.realized_pnl()),
            Err(e) => {
                warn!(error = %e, "transaction lookup failed");
                None
            }
        }
    }

    /// Close every open position on the account, best effort.
    pub async fn close_all_positions(&self) -> Result<usize> {
        let positions = self.client.list_positions().await?;
        let mut closed = 0;
        for entry in &positions {
            let direction = match Direction::from_str_upper(&entry.position.direction) {
                Some(direction) => direction,
                None => {
                    warn!(raw = %entry.position.direction, "unknown position direction");
                    continue;
                }
            };
            let currency = entry.position.currency.as_deref().unwrap_or("EUR");
            if self
                .close_with_retries(
                    &entry.market.epic,
                    entry.market.dealing_expiry(),
                    &entry.position.deal_id,
                    direction,
                    entry.position.size,
                    currency,
                )
                .await
            {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Log in, close everything, log out. Used by the close-all command.
    pub async fn run_close_all(&self) -> Result<usize> {
        self.client.login().await.context("login failed")?;
        let closed = self.close_all_positions().await;
        if let Err(e) = self.client.logout().await {
            warn!(error = %e, "logout failed");
        }
        closed
    }

    /// Graceful teardown: flatten anything still open, then end the session.
    async fn teardown(&self) -> Result<()> {
        info!(
            realized = %self.totals.realized_estimate_eur,
            trades = self.totals.trade_count,
            "session ending"
        );
        if !self.config.dry_run {
            match self.close_all_positions().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "flattened remaining positions"),
                Err(e) => warn!(error = %e, "could not verify flat book"),
            }
        }
        self.client.logout().await?;
        info!("session ended");
        Ok(())
    }

    /// Wait, in small slices so a shutdown signal is honored promptly.
    async fn idle(&self, secs: u64) {
        let mut remaining = secs.max(1);
        while remaining > 0 && !self.shutting_down() {
            sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }
    }
}

fn quote_from_entry(entry: &PositionEntry) -> Option<Quote> {
    let market = &entry.market;
    match (market.bid, market.offer) {
        (Some(bid), Some(offer)) => Some(Quote {
            mid: (bid + offer) / Decimal::TWO,
            spread: Some(offer - bid),
        }),
        (Some(one), None) | (None, Some(one)) => Some(Quote {
            mid: one,
            spread: None,
        }),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{PositionData, PositionMarket};
    use rust_decimal_macros::dec;

    fn entry_with(bid: Option<Decimal>, offer: Option<Decimal>) -> PositionEntry {
        PositionEntry {
            position: PositionData {
                deal_id: "DEAL1".to_string(),
                direction: "BUY".to_string(),
                size: dec!(0.5),
                level: dec!(20000),
                stop_level: Some(dec!(19994)),
                limit_level: Some(dec!(20002)),
                currency: Some("EUR".to_string()),
            },
            market: PositionMarket {
                epic: "IX.D.DAX.IFMM.IP".to_string(),
                expiry: Some("-".to_string()),
                bid,
                offer,
            },
        }
    }

    #[test]
    fn quote_prefers_both_sides() {
        let quote = quote_from_entry(&entry_with(Some(dec!(19999)), Some(dec!(20001)))).unwrap();
        assert_eq!(quote.mid, dec!(20000));
        assert_eq!(quote.spread, Some(dec!(2)));
    }

    #[test]
    fn quote_degrades_to_one_side() {
        let quote = quote_from_entry(&entry_with(Some(dec!(19999)), None)).unwrap();
        assert_eq!(quote.mid, dec!(19999));
        assert_eq!(quote.spread, None);

        assert!(quote_from_entry(&entry_with(None, None)).is_none());
    }
}
