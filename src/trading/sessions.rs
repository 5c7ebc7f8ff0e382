//! Trading session windows in exchange-local time.
//!
//! The DAX cash session is quoted in Europe/Berlin wall-clock time, so the
//! windows are evaluated there regardless of host timezone. Weekends are
//! always out of session.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Europe::Berlin;
use chrono_tz::Tz;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session window '{0}', expected HH:MM-HH:MM")]
    InvalidWindow(String),
    #[error("session window '{0}' ends before it starts")]
    InvertedWindow(String),
}

/// One intraday window, inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time < self.end
    }

    /// Parse "HH:MM-HH:MM".
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| SessionError::InvalidWindow(s.to_string()))?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|_| SessionError::InvalidWindow(s.to_string()))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|_| SessionError::InvalidWindow(s.to_string()))?;
        if end <= start {
            return Err(SessionError::InvertedWindow(s.to_string()));
        }
        Ok(Self { start, end })
    }
}

/// The set of windows the bot is allowed to open trades in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub windows: Vec<SessionWindow>,
    #[serde(skip, default = "berlin")]
    pub timezone: Tz,
}

fn berlin() -> Tz {
    Berlin
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                window(9, 5, 11, 15),
                window(15, 30, 17, 5),
            ],
            timezone: Berlin,
        }
    }
}

fn window(sh: u32, sm: u32, eh: u32, em: u32) -> SessionWindow {
    // Static in-range constants.
    SessionWindow {
        start: NaiveTime::from_hms_opt(sh, sm, 0).unwrap_or(NaiveTime::MIN),
        end: NaiveTime::from_hms_opt(eh, em, 0).unwrap_or(NaiveTime::MIN),
    }
}

impl SessionConfig {
    /// Build from comma-separated "HH:MM-HH:MM" window specs.
    pub fn from_spec(spec: &str) -> Result<Self, SessionError> {
        let mut windows = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            windows.push(SessionWindow::parse(part)?);
        }
        if windows.is_empty() {
            return Err(SessionError::InvalidWindow(spec.to_string()));
        }
        Ok(Self {
            windows,
            timezone: Berlin,
        })
    }

    /// Whether `now` falls inside an allowed window, in exchange-local time.
    pub fn in_session(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = local.time();
        self.windows.iter().any(|w| w.contains(time))
    }

    /// Human-readable window list for startup logging.
    pub fn describe(&self) -> String {
        self.windows
            .iter()
            .map(|w| format!("{}-{}", w.start.format("%H:%M"), w.end.format("%H:%M")))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_berlin(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Berlin
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }

    #[test]
    fn default_windows_cover_morning_and_afternoon() {
        let config = SessionConfig::default();

        // Tuesday 2026-03-03.
        assert!(config.in_session(at_berlin(2026, 3, 3, 9, 5)));
        assert!(config.in_session(at_berlin(2026, 3, 3, 10, 30)));
        assert!(!config.in_session(at_berlin(2026, 3, 3, 11, 15)));
        assert!(!config.in_session(at_berlin(2026, 3, 3, 12, 0)));
        assert!(config.in_session(at_berlin(2026, 3, 3, 15, 30)));
        assert!(!config.in_session(at_berlin(2026, 3, 3, 17, 5)));
    }

    #[test]
    fn weekends_are_never_in_session() {
        let config = SessionConfig::default();
        // Saturday / Sunday 2026-03-07 and -08.
        assert!(!config.in_session(at_berlin(2026, 3, 7, 10, 0)));
        assert!(!config.in_session(at_berlin(2026, 3, 8, 10, 0)));
    }

    #[test]
    fn evaluation_uses_berlin_wall_clock() {
        let config = SessionConfig::default();
        // 08:30 UTC in CEST summer is 10:30 in Berlin, inside the morning
        // window even though 08:30 itself is not.
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 8, 30, 0).single().unwrap();
        assert!(config.in_session(now));
    }

    #[test]
    fn parses_window_specs() {
        let config = SessionConfig::from_spec("08:00-09:30, 14:00-15:00").unwrap();
        assert_eq!(config.windows.len(), 2);
        assert!(config.in_session(at_berlin(2026, 3, 3, 8, 0)));
        assert!(!config.in_session(at_berlin(2026, 3, 3, 9, 30)));
        assert!(config.in_session(at_berlin(2026, 3, 3, 14, 59)));
    }

    #[test]
    fn rejects_malformed_and_inverted_windows() {
        assert!(matches!(
            SessionConfig::from_spec("nine to five"),
            Err(SessionError::InvalidWindow(_))
        ));
        assert!(matches!(
            SessionConfig::from_spec("11:00-09:00"),
            Err(SessionError::InvertedWindow(_))
        ));
        assert!(matches!(
            SessionConfig::from_spec(""),
            Err(SessionError::InvalidWindow(_))
        ));
    }
}
