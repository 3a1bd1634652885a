//! Trading session and rate-limit decisions.
//!
//! Pure functions of an instant and configuration. Sessions are derived from
//! the UTC hour only (no DST adjustment):
//!
//! | Session           | UTC hours           |
//! |-------------------|---------------------|
//! | Asian             | 00:00 - 07:00       |
//! | London            | 07:00 - 12:00       |
//! | London/New York   | 12:00 - 16:00       |
//! | New York          | 16:00 - 21:00       |
//! | Sydney            | 21:00 - 24:00       |
//! | Weekend           | Fri 21:00 - Sun 21:00 |

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::AssetClass;
use crate::config::SessionConfig;

/// Liquidity window of the global FX market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingSession {
    Asian,
    London,
    LondonNewYork,
    NewYork,
    Sydney,
    Weekend,
}

impl TradingSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingSession::Asian => "asian",
            TradingSession::London => "london",
            TradingSession::LondonNewYork => "london_new_york",
            TradingSession::NewYork => "new_york",
            TradingSession::Sydney => "sydney",
            TradingSession::Weekend => "weekend",
        }
    }
}

impl fmt::Display for TradingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session active at `time`.
pub fn current_session(time: DateTime<Utc>) -> TradingSession {
    let hour = time.hour();

    let weekend = match time.weekday() {
        Weekday::Sat => true,
        Weekday::Sun => hour < 21,
        Weekday::Fri => hour >= 21,
        _ => false,
    };
    if weekend {
        return TradingSession::Weekend;
    }

    match hour {
        0..=6 => TradingSession::Asian,
        7..=11 => TradingSession::London,
        12..=15 => TradingSession::LondonNewYork,
        16..=20 => TradingSession::NewYork,
        _ => TradingSession::Sydney,
    }
}

/// Whether a session-sensitive symbol should be skipped at `time`.
pub fn should_skip_for_session(
    time: DateTime<Utc>,
    enabled: bool,
    skip_sessions: &[TradingSession],
) -> (bool, String) {
    if !enabled {
        return (false, "session filtering disabled".to_string());
    }

    let session = current_session(time);
    if skip_sessions.contains(&session) {
        (true, format!("low-liquidity session: {session}"))
    } else {
        (false, format!("active session: {session}"))
    }
}

/// Whether a symbol was scanned too recently to be analysed again.
///
/// A symbol that has never been scanned is always allowed.
pub fn should_skip_for_rate_limit(
    last_scanned: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> (bool, String) {
    let Some(last) = last_scanned else {
        return (false, "never scanned".to_string());
    };

    let elapsed = now - last;
    if elapsed < interval {
        let wait = interval - elapsed;
        (
            true,
            format!(
                "scanned {}s ago, next allowed in {}s",
                elapsed.num_seconds(),
                wait.num_seconds()
            ),
        )
    } else {
        (false, format!("scanned {}s ago", elapsed.num_seconds()))
    }
}

/// Session rules bound to configuration.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    config: SessionConfig,
}

impl SessionFilter {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn is_session_sensitive(&self, asset_class: AssetClass) -> bool {
        self.config.sensitive_assets.contains(&asset_class)
    }

    /// Session decision for one symbol; assets that are not session-sensitive
    /// are never skipped.
    pub fn check(
        &self,
        asset_class: AssetClass,
        time: DateTime<Utc>,
        enabled: bool,
    ) -> (bool, String) {
        if !self.is_session_sensitive(asset_class) {
            return (false, format!("{asset_class} trades in every session"));
        }
        should_skip_for_session(time, enabled, &self.config.skip_sessions)
    }
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
