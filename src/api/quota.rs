//! Rolling counters for IG's per-minute request allowances and the weekly
//! historical-price point allowance. Purely observational; the client logs
//! the snapshot periodically so a quota breach can be traced afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::info;

const MINUTE: Duration = Duration::from_secs(60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);
const REPORT_EVERY: Duration = Duration::from_secs(300);

/// Which allowance a request counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Session create/refresh.
    Auth,
    /// Dealing calls: open, amend, close.
    Trade,
    /// Prices and market details.
    Data,
    Other,
}

#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
}

impl Window {
    fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) > MINUTE {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }
}

/// Point-in-time usage readout.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSnapshot {
    pub auth_per_minute: usize,
    pub trade_per_minute: usize,
    pub data_per_minute: usize,
    pub other_per_minute: usize,
    pub history_points_week: u64,
}

impl fmt::Display for QuotaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "auth {}/min, trade {}/min, data {}/min, other {}/min, history {} pts/week",
            self.auth_per_minute,
            self.trade_per_minute,
            self.data_per_minute,
            self.other_per_minute,
            self.history_points_week
        )
    }
}

pub struct QuotaTracker {
    auth: Window,
    trade: Window,
    data: Window,
    other: Window,
    history_points: VecDeque<(Instant, u64)>,
    last_report: Instant,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            auth: Window::default(),
            trade: Window::default(),
            data: Window::default(),
            other: Window::default(),
            history_points: VecDeque::new(),
            last_report: Instant::now(),
        }
    }

    pub fn record(&mut self, kind: RequestKind) {
        let now = Instant::now();
        match kind {
            RequestKind::Auth => self.auth.record(now),
            RequestKind::Trade => self.trade.record(now),
            RequestKind::Data => self.data.record(now),
            RequestKind::Other => self.other.record(now),
        }
    }

    /// Count historical price points against the weekly allowance. One bar
    /// fetched is one point.
    pub fn record_history_points(&mut self, points: u64) {
        let now = Instant::now();
        self.history_points.push_back((now, points));
        self.prune_history(now);
    }

    fn prune_history(&mut self, now: Instant) {
        while let Some(&(front, _)) = self.history_points.front() {
            if now.duration_since(front) > WEEK {
                self.history_points.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&mut self) -> QuotaSnapshot {
        let now = Instant::now();
        self.prune_history(now);
        QuotaSnapshot {
            auth_per_minute: self.auth.count(now),
            trade_per_minute: self.trade.count(now),
            data_per_minute: self.data.count(now),
            other_per_minute: self.other.count(now),
            history_points_week: self.history_points.iter().map(|&(_, p)| p).sum(),
        }
    }

    /// Log the snapshot at most once per report interval.
    pub fn maybe_report(&mut self) {
        if self.last_report.elapsed() < REPORT_EVERY {
            return;
        }
        let snapshot = self.snapshot();
        info!(%snapshot, "api quota usage");
        self.last_report = Instant::now();
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_per_bucket() {
        let mut tracker = QuotaTracker::new();
        tracker.record(RequestKind::Data);
        tracker.record(RequestKind::Data);
        tracker.record(RequestKind::Trade);
        let snap = tracker.snapshot();
        assert_eq!(snap.data_per_minute, 2);
        assert_eq!(snap.trade_per_minute, 1);
        assert_eq!(snap.auth_per_minute, 0);
    }

    #[test]
    fn accumulates_history_points() {
        let mut tracker = QuotaTracker::new();
        tracker.record_history_points(30);
        tracker.record_history_points(230);
        assert_eq!(tracker.snapshot().history_points_week, 260);
    }

    #[test]
    fn snapshot_formats_for_logging() {
        let mut tracker = QuotaTracker::new();
        tracker.record(RequestKind::Auth);
        let text = tracker.snapshot().to_string();
        assert!(text.contains("auth 1/min"));
        assert!(text.contains("pts/week"));
    }
}
