//! SQLite-backed repository.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::Repository;
use crate::scanner::{
    CircuitBreaker, ConfigUpdate, CycleHistoryRecord, KillSwitch, ScannerConfig, WatchlistSymbol,
};

/// SQLite persistence for scanner config, watchlist, history and safety flags.
///
/// The async trait methods run their queries on tokio's blocking pool; the
/// inherent helpers are synchronous and meant for the CLI.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("database connection lock poisoned"))
}

fn query_symbols(conn: &Connection, enabled_only: bool) -> Result<Vec<WatchlistSymbol>> {
    let sql = if enabled_only {
        "SELECT symbol, asset_class, timeframe, last_scanned_at, enabled
         FROM watchlist WHERE enabled = 1 ORDER BY rowid"
    } else {
        "SELECT symbol, asset_class, timeframe, last_scanned_at, enabled
         FROM watchlist ORDER BY rowid"
    };

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut symbols = Vec::with_capacity(rows.len());
    for (symbol, asset_class, timeframe, last_scanned, enabled) in rows {
        let asset_class = match asset_class.parse() {
            Ok(class) => class,
            Err(e) => {
                warn!(%symbol, error = %e, "Skipping watchlist row with unknown asset class");
                continue;
            }
        };
        symbols.push(WatchlistSymbol {
            symbol,
            asset_class,
            timeframe,
            last_scanned_at: parse_ts(last_scanned),
            enabled,
        });
    }
    Ok(symbols)
}

fn load_config(conn: &Connection) -> Result<ScannerConfig> {
    conn.query_row(
        r#"
        SELECT scan_interval_secs, batch_size, last_cycle_at,
               session_filter_enabled, is_running
        FROM scanner_config WHERE id = 1
        "#,
        [],
        |row| {
            Ok(ScannerConfig {
                scan_interval_secs: row.get(0)?,
                batch_size: row.get(1)?,
                last_cycle_at: parse_ts(row.get(2)?),
                session_filter_enabled: row.get(3)?,
                is_running: row.get(4)?,
            })
        },
    )
    .context("Failed to load scanner config")
}

fn apply_config_update(conn: &Connection, update: &ConfigUpdate) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    if let Some(interval) = update.scan_interval_secs {
        tx.execute(
            "UPDATE scanner_config SET scan_interval_secs = ?1 WHERE id = 1",
            params![interval],
        )?;
    }
    if let Some(batch_size) = update.batch_size {
        tx.execute(
            "UPDATE scanner_config SET batch_size = ?1 WHERE id = 1",
            params![batch_size],
        )?;
    }
    if let Some(enabled) = update.session_filter_enabled {
        tx.execute(
            "UPDATE scanner_config SET session_filter_enabled = ?1 WHERE id = 1",
            params![enabled],
        )?;
    }
    if let Some(running) = update.is_running {
        tx.execute(
            "UPDATE scanner_config SET is_running = ?1 WHERE id = 1",
            params![running],
        )?;
    }

    tx.commit()?;
    debug!(?update, "Scanner config updated");
    Ok(())
}

fn insert_history(conn: &Connection, record: &CycleHistoryRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO scan_history (cycle_id, started_at, finished_at, duration_ms, status,
                                  watchlist_size, scanned, signals_found, errors, no_data,
                                  skipped_session, skipped_rate_limit, kill_switch_triggered,
                                  error_message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            record.cycle_id,
            record.started_at.to_rfc3339(),
            record.finished_at.to_rfc3339(),
            record.duration_ms,
            record.status.as_str(),
            record.watchlist_size,
            record.scanned,
            record.signals_found,
            record.errors,
            record.no_data,
            record.skipped_session,
            record.skipped_rate_limit,
            record.kill_switch_triggered,
            record.error_message,
        ],
    )?;
    Ok(())
}

impl SqliteRepository {
    /// Open (or create) the database, seeding the config row with `defaults`
    /// if it does not exist yet.
    pub fn open<P: AsRef<Path>>(db_path: P, defaults: &ScannerConfig) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path:?}"))?;

        let repo = Self::from_connection(conn, defaults)?;
        info!("Scanner database initialized at {:?}", path);
        Ok(repo)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn in_memory(defaults: &ScannerConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, defaults)
    }

    fn from_connection(conn: Connection, defaults: &ScannerConfig) -> Result<Self> {
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema(defaults)?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_conn(&self.conn)
    }

    /// Run `query` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || query(&*lock_conn(&conn)?))
            .await
            .context("Database task did not complete")?
    }

    /// Initialize database schema.
    fn init_schema(&self, defaults: &ScannerConfig) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Scanner settings (singleton row)
            CREATE TABLE IF NOT EXISTS scanner_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                scan_interval_secs INTEGER NOT NULL,
                batch_size INTEGER NOT NULL,
                last_cycle_at TEXT,
                session_filter_enabled INTEGER NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 0
            );

            -- Watchlist
            CREATE TABLE IF NOT EXISTS watchlist (
                symbol TEXT PRIMARY KEY,
                asset_class TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                last_scanned_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL
            );

            -- One row per scan cycle
            CREATE TABLE IF NOT EXISTS scan_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                watchlist_size INTEGER NOT NULL,
                scanned INTEGER NOT NULL,
                signals_found INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                no_data INTEGER NOT NULL,
                skipped_session INTEGER NOT NULL,
                skipped_rate_limit INTEGER NOT NULL,
                kill_switch_triggered INTEGER NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_history_started ON scan_history(started_at);

            -- Per-user safety overrides
            CREATE TABLE IF NOT EXISTS safety_flags (
                user_id TEXT PRIMARY KEY,
                kill_switch_active INTEGER NOT NULL DEFAULT 0,
                circuit_breaker_open INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO scanner_config
                (id, scan_interval_secs, batch_size, last_cycle_at, session_filter_enabled, is_running)
            VALUES (1, ?1, ?2, NULL, ?3, 0)
            "#,
            params![
                defaults.scan_interval_secs,
                defaults.batch_size,
                defaults.session_filter_enabled,
            ],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ==================== Watchlist management ====================

    /// Insert a symbol or update its asset class / timeframe / enabled flag.
    pub fn upsert_symbol(&self, symbol: &WatchlistSymbol) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO watchlist (symbol, asset_class, timeframe, last_scanned_at, enabled, added_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(symbol) DO UPDATE SET
                asset_class = ?2,
                timeframe = ?3,
                enabled = ?5
            "#,
            params![
                symbol.symbol,
                symbol.asset_class.as_str(),
                symbol.timeframe,
                symbol.last_scanned_at.map(|t| t.to_rfc3339()),
                symbol.enabled,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove a symbol. Returns false if it was not on the watchlist.
    pub fn remove_symbol(&self, symbol: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM watchlist WHERE symbol = ?1", params![symbol])?;
        Ok(removed > 0)
    }

    /// Enable or disable a symbol. Returns false if it was not on the watchlist.
    pub fn set_symbol_enabled(&self, symbol: &str, enabled: bool) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE watchlist SET enabled = ?2 WHERE symbol = ?1",
            params![symbol, enabled],
        )?;
        Ok(updated > 0)
    }

    /// Every symbol, enabled or not, in watchlist order.
    pub fn list_symbols(&self) -> Result<Vec<WatchlistSymbol>> {
        query_symbols(&*self.conn()?, false)
    }

    // ==================== History ====================

    /// Most recent history rows, newest first.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<CycleHistoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT cycle_id, started_at, finished_at, duration_ms, status, watchlist_size,
                   scanned, signals_found, errors, no_data, skipped_session,
                   skipped_rate_limit, kill_switch_triggered, error_message
            FROM scan_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map(params![limit], Self::history_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode scan history")?;
        Ok(records)
    }

    fn history_from_row(row: &Row<'_>) -> rusqlite::Result<CycleHistoryRecord> {
        let status: String = row.get(4)?;
        Ok(CycleHistoryRecord {
            cycle_id: row.get(0)?,
            started_at: parse_ts(row.get(1)?).unwrap_or_else(Utc::now),
            finished_at: parse_ts(row.get(2)?).unwrap_or_else(Utc::now),
            duration_ms: row.get(3)?,
            status: status.parse().map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            watchlist_size: row.get(5)?,
            scanned: row.get(6)?,
            signals_found: row.get(7)?,
            errors: row.get(8)?,
            no_data: row.get(9)?,
            skipped_session: row.get(10)?,
            skipped_rate_limit: row.get(11)?,
            kill_switch_triggered: row.get(12)?,
            error_message: row.get(13)?,
        })
    }

    // ==================== Safety flags ====================

    pub fn set_kill_switch(&self, user_id: &str, active: bool) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO safety_flags (user_id, kill_switch_active, circuit_breaker_open, updated_at)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT(user_id) DO UPDATE SET kill_switch_active = ?2, updated_at = ?3
            "#,
            params![user_id, active, Utc::now().to_rfc3339()],
        )?;
        info!(user_id, active, "Kill switch updated");
        Ok(())
    }

    pub fn set_circuit_breaker(&self, user_id: &str, open: bool) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO safety_flags (user_id, kill_switch_active, circuit_breaker_open, updated_at)
            VALUES (?1, 0, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET circuit_breaker_open = ?2, updated_at = ?3
            "#,
            params![user_id, open, Utc::now().to_rfc3339()],
        )?;
        info!(user_id, open, "Circuit breaker updated");
        Ok(())
    }

    async fn safety_flag(&self, user_id: &str, column: &'static str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {column} FROM safety_flags WHERE user_id = ?1");
            let value: Option<bool> = conn
                .query_row(&sql, params![user_id], |row| row.get(0))
                .optional()?;
            Ok(value.unwrap_or(false))
        })
        .await
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all scanner data");
        self.conn()?.execute_batch(
            r#"
            DELETE FROM watchlist;
            DELETE FROM scan_history;
            DELETE FROM safety_flags;
            UPDATE scanner_config SET last_cycle_at = NULL, is_running = 0;
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_config(&self) -> Result<ScannerConfig> {
        self.with_conn(load_config).await
    }

    async fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        self.with_conn(move |conn| apply_config_update(conn, &update))
            .await
    }

    async fn get_symbol_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM watchlist WHERE enabled = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn get_enabled_symbols(&self) -> Result<Vec<WatchlistSymbol>> {
        self.with_conn(|conn| query_symbols(conn, true)).await
    }

    async fn update_last_scanned(&self, symbol: &str, at: DateTime<Utc>) -> Result<()> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE watchlist SET last_scanned_at = ?2 WHERE symbol = ?1",
                params![symbol, at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_last_cycle_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scanner_config SET last_cycle_at = ?1 WHERE id = 1",
                params![at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_history(&self, record: &CycleHistoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| insert_history(conn, &record)).await
    }
}

#[async_trait]
impl KillSwitch for SqliteRepository {
    async fn is_active(&self, user_id: &str) -> Result<bool> {
        self.safety_flag(user_id, "kill_switch_active").await
    }
}

#[async_trait]
impl CircuitBreaker for SqliteRepository {
    async fn is_open(&self, user_id: &str) -> Result<bool> {
        self.safety_flag(user_id, "circuit_breaker_open").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{AssetClass, CycleStatus, ScanCycleResult};

    fn repo() -> SqliteRepository {
        SqliteRepository::in_memory(&ScannerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_config_seeded_and_updated() {
        let defaults = ScannerConfig {
            scan_interval_secs: 120,
            batch_size: 5,
            ..Default::default()
        };
        let repo = SqliteRepository::in_memory(&defaults).unwrap();

        let config = repo.get_config().await.unwrap();
        assert_eq!(config.scan_interval_secs, 120);
        assert_eq!(config.batch_size, 5);
        assert!(!config.is_running);
        assert!(config.last_cycle_at.is_none());

        repo.update_config(ConfigUpdate {
            batch_size: Some(25),
            is_running: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

        let config = repo.get_config().await.unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.scan_interval_secs, 120);
        assert!(config.is_running);
    }

    #[tokio::test]
    async fn test_watchlist_order_and_enabled_filter() {
        let repo = repo();
        for symbol in ["EURUSD", "BTCUSD", "AAPL"] {
            let class = match symbol {
                "EURUSD" => AssetClass::Forex,
                "BTCUSD" => AssetClass::Crypto,
                _ => AssetClass::Stock,
            };
            repo.upsert_symbol(&WatchlistSymbol::new(symbol, class, "1h"))
                .unwrap();
        }
        assert!(repo.set_symbol_enabled("BTCUSD", false).unwrap());

        let enabled = repo.get_enabled_symbols().await.unwrap();
        let names: Vec<_> = enabled.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(names, vec!["EURUSD", "AAPL"]);
        assert_eq!(repo.get_symbol_count().await.unwrap(), 2);
        assert_eq!(repo.list_symbols().unwrap().len(), 3);

        assert!(repo.remove_symbol("AAPL").unwrap());
        assert!(!repo.remove_symbol("AAPL").unwrap());
    }

    #[tokio::test]
    async fn test_last_scanned_round_trip() {
        let repo = repo();
        repo.upsert_symbol(&WatchlistSymbol::new("EURUSD", AssetClass::Forex, "1h"))
            .unwrap();

        let now = Utc::now();
        repo.update_last_scanned("EURUSD", now).await.unwrap();

        let symbols = repo.get_enabled_symbols().await.unwrap();
        let stored = symbols[0].last_scanned_at.unwrap();
        assert_eq!(stored.timestamp_millis(), now.timestamp_millis());

        // upsert must not clobber scan progress
        repo.upsert_symbol(&WatchlistSymbol::new("EURUSD", AssetClass::Forex, "4h"))
            .unwrap();
        let symbols = repo.get_enabled_symbols().await.unwrap();
        assert_eq!(symbols[0].timeframe, "4h");
        assert!(symbols[0].last_scanned_at.is_some());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let repo = repo();
        for status in [CycleStatus::Completed, CycleStatus::Skipped] {
            let mut result = ScanCycleResult::begin();
            result.status = status;
            result.finished_at = Some(Utc::now());
            repo.add_history(&result.to_history()).await.unwrap();
        }

        let history = repo.recent_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, CycleStatus::Skipped);
        assert_eq!(history[1].status, CycleStatus::Completed);
        assert_eq!(repo.recent_history(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_safety_flags_per_user() {
        let repo = repo();
        assert!(!repo.is_active("alice").await.unwrap());

        repo.set_kill_switch("alice", true).unwrap();
        repo.set_circuit_breaker("bob", true).unwrap();

        assert!(repo.is_active("alice").await.unwrap());
        assert!(!repo.is_open("alice").await.unwrap());
        assert!(repo.is_open("bob").await.unwrap());
        assert!(!repo.is_active("bob").await.unwrap());

        repo.set_kill_switch("alice", false).unwrap();
        assert!(!repo.is_active("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_all_resets_state() {
        let repo = repo();
        repo.upsert_symbol(&WatchlistSymbol::new("EURUSD", AssetClass::Forex, "1h"))
            .unwrap();
        repo.set_kill_switch("alice", true).unwrap();
        tokio_test::assert_ok!(repo.update_config(ConfigUpdate::running(true)).await);
        tokio_test::assert_ok!(repo.set_last_cycle_at(Utc::now()).await);

        tokio_test::assert_ok!(repo.clear_all());

        assert!(repo.list_symbols().unwrap().is_empty());
        assert!(!repo.is_active("alice").await.unwrap());
        let config = repo.get_config().await.unwrap();
        assert!(!config.is_running);
        assert!(config.last_cycle_at.is_none());
    }

    #[tokio::test]
    async fn test_query_waits_on_blocking_pool() {
        let repo = Arc::new(repo());
        let held = repo.conn().unwrap();

        let pending = tokio::spawn({
            let repo = repo.clone();
            async move { repo.get_config().await }
        });
        // The runtime thread stays free while the query waits for the connection
        let other = tokio::spawn(async {
            tokio::task::yield_now().await;
            7
        });
        assert_eq!(other.await.unwrap(), 7);
        assert!(!pending.is_finished());

        drop(held);
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_undecodable_history_row_is_an_error() {
        let repo = repo();
        let mut result = ScanCycleResult::begin();
        result.finished_at = Some(Utc::now());
        repo.add_history(&result.to_history()).await.unwrap();

        repo.conn()
            .unwrap()
            .execute("UPDATE scan_history SET status = 'EXPLODED'", [])
            .unwrap();

        let err = repo.recent_history(10).unwrap_err();
        assert!(err.to_string().contains("Failed to decode scan history"));
    }
}
