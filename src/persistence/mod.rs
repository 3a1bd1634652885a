//! Scanner persistence.
//!
//! The [`Repository`] trait is what the scan cycle and lifecycle depend on.
//! [`SqliteRepository`] is the bundled implementation; it also stores the
//! per-user kill switch and circuit breaker flags.

mod sqlite;

pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::scanner::{ConfigUpdate, CycleHistoryRecord, ScannerConfig, WatchlistSymbol};

/// Config, watchlist and history storage.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_config(&self) -> Result<ScannerConfig>;

    async fn update_config(&self, update: ConfigUpdate) -> Result<()>;

    /// Number of enabled watchlist symbols.
    async fn get_symbol_count(&self) -> Result<usize>;

    /// Enabled symbols in watchlist order.
    async fn get_enabled_symbols(&self) -> Result<Vec<WatchlistSymbol>>;

    async fn update_last_scanned(&self, symbol: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_last_cycle_at(&self, at: DateTime<Utc>) -> Result<()>;

    async fn add_history(&self, record: &CycleHistoryRecord) -> Result<()>;
}
