//! Data model shared by the scan cycle, lifecycle and persistence layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::analysis::TradeSignal;

/// Instrument category of a watchlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Forex,
    Crypto,
    Stock,
    Index,
    Commodity,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Forex => "forex",
            AssetClass::Crypto => "crypto",
            AssetClass::Stock => "stock",
            AssetClass::Index => "index",
            AssetClass::Commodity => "commodity",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "forex" | "fx" => Ok(AssetClass::Forex),
            "crypto" => Ok(AssetClass::Crypto),
            "stock" | "stocks" | "equity" => Ok(AssetClass::Stock),
            "index" | "indices" => Ok(AssetClass::Index),
            "commodity" | "commodities" => Ok(AssetClass::Commodity),
            other => anyhow::bail!("Unknown asset class: {other}"),
        }
    }
}

/// A persisted watchlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistSymbol {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub timeframe: String,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl WatchlistSymbol {
    /// An enabled, never-scanned entry.
    pub fn new(symbol: &str, asset_class: AssetClass, timeframe: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            asset_class,
            timeframe: timeframe.to_string(),
            last_scanned_at: None,
            enabled: true,
        }
    }
}

/// Persisted scanner settings (singleton row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub session_filter_enabled: bool,
    pub is_running: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            batch_size: 10,
            last_cycle_at: None,
            session_filter_enabled: true,
            is_running: false,
        }
    }
}

/// Partial update of [`ScannerConfig`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub scan_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub session_filter_enabled: Option<bool>,
    pub is_running: Option<bool>,
}

impl ConfigUpdate {
    pub fn running(is_running: bool) -> Self {
        Self {
            is_running: Some(is_running),
            ..Default::default()
        }
    }
}

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    /// Every eligible symbol was handled
    Completed,
    /// Interrupted, or some-but-not-all analysed symbols failed
    Partial,
    /// Every analysed symbol failed
    Failed,
    /// Nothing analysed; all symbols skipped by session or rate limit
    Filtered,
    /// Safety gate or missing engine prevented the cycle from running
    Skipped,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Partial => "PARTIAL",
            CycleStatus::Failed => "FAILED",
            CycleStatus::Filtered => "FILTERED",
            CycleStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(CycleStatus::Completed),
            "PARTIAL" => Ok(CycleStatus::Partial),
            "FAILED" => Ok(CycleStatus::Failed),
            "FILTERED" => Ok(CycleStatus::Filtered),
            "SKIPPED" => Ok(CycleStatus::Skipped),
            other => anyhow::bail!("Unknown cycle status: {other}"),
        }
    }
}

/// Everything one cycle produced. Persisted as a [`CycleHistoryRecord`] and
/// then dropped.
#[derive(Debug, Clone)]
pub struct ScanCycleResult {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub watchlist_size: usize,
    pub batches: usize,
    pub scanned: usize,
    /// Signals produced by the engine, including any dropped by the cap
    pub signals_found: usize,
    pub errors: usize,
    pub no_data: usize,
    pub skipped_session: usize,
    pub skipped_rate_limit: usize,
    pub status: CycleStatus,
    /// Retained signals, at most `max_signals_per_cycle`
    pub signals: Vec<TradeSignal>,
    pub signals_truncated: bool,
    pub kill_switch_triggered: bool,
    pub correlation_ids: Vec<String>,
    pub error_message: Option<String>,
}

impl ScanCycleResult {
    pub fn begin() -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            watchlist_size: 0,
            batches: 0,
            scanned: 0,
            signals_found: 0,
            errors: 0,
            no_data: 0,
            skipped_session: 0,
            skipped_rate_limit: 0,
            status: CycleStatus::Completed,
            signals: Vec::new(),
            signals_truncated: false,
            kill_switch_triggered: false,
            correlation_ids: Vec::new(),
            error_message: None,
        }
    }

    /// Symbols neither analysed nor skipped (left over after an interruption).
    pub fn remaining(&self) -> usize {
        self.watchlist_size
            .saturating_sub(self.scanned + self.skipped_session + self.skipped_rate_limit)
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }

    pub fn to_history(&self) -> CycleHistoryRecord {
        CycleHistoryRecord {
            cycle_id: self.cycle_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
            duration_ms: self.duration_ms(),
            status: self.status,
            watchlist_size: self.watchlist_size,
            scanned: self.scanned,
            signals_found: self.signals_found,
            errors: self.errors,
            no_data: self.no_data,
            skipped_session: self.skipped_session,
            skipped_rate_limit: self.skipped_rate_limit,
            kill_switch_triggered: self.kill_switch_triggered,
            error_message: self.error_message.clone(),
        }
    }
}

/// One row of scan history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleHistoryRecord {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: CycleStatus,
    pub watchlist_size: usize,
    pub scanned: usize,
    pub signals_found: usize,
    pub errors: usize,
    pub no_data: usize,
    pub skipped_session: usize,
    pub skipped_rate_limit: usize,
    pub kill_switch_triggered: bool,
    pub error_message: Option<String>,
}
