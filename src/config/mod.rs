//! Configuration management for the signal scanner.
//!
//! Loads settings from an optional `config.toml` and `SCANNER__*` environment
//! variables. These are process-level settings; the per-deployment scan
//! interval, batch size and session-filter flag live in the database
//! (`ScannerConfig`) and are only seeded from here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scanner::{AssetClass, ScannerConfig, TradingSession};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database location
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Scan loop tuning
    #[serde(default)]
    pub scanner: ScannerSettings,
    /// Kill switch and circuit breaker behaviour
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Trading session filtering
    #[serde(default)]
    pub session: SessionConfig,
    /// External analysis service
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Interval between cycles used to seed a fresh database
    #[serde(default = "default_scan_interval")]
    pub default_interval_secs: u64,
    /// Batch size used to seed a fresh database
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    /// Session filtering flag used to seed a fresh database
    #[serde(default = "default_true")]
    pub default_session_filter: bool,
    /// Pause between batches within one cycle
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// How long stop() waits for the loop before aborting it
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Sleep after a cycle fails with an infrastructure error
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Upper bound on signals retained in a single cycle result
    #[serde(default = "default_max_signals")]
    pub max_signals_per_cycle: usize,
    /// Optional per-symbol analysis timeout (unset = wait indefinitely)
    #[serde(default)]
    pub analysis_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// User whose kill switch and circuit breaker govern this scanner
    #[serde(default)]
    pub user_id: Option<String>,
    /// How long a kill-switch lookup is reused within a cycle
    #[serde(default = "default_kill_switch_ttl")]
    pub kill_switch_cache_secs: u64,
    /// Treat a failed safety lookup as "active" (true) or "inactive" (false)
    #[serde(default = "default_true")]
    pub fail_safe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Asset classes whose liquidity depends on the trading session
    #[serde(default = "default_session_sensitive")]
    pub sensitive_assets: Vec<AssetClass>,
    /// Sessions in which session-sensitive symbols are not analysed
    #[serde(default = "default_skip_sessions")]
    pub skip_sessions: Vec<TradingSession>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the HTTP analysis service (unset = no engine attached)
    #[serde(default)]
    pub base_url: Option<String>,
    /// HTTP request timeout
    #[serde(default = "default_engine_timeout")]
    pub request_timeout_secs: u64,
}

// Default value functions
fn default_db_path() -> String {
    "data/scanner.db".to_string()
}

fn default_scan_interval() -> u64 {
    300 // 5 minutes
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_stop_grace() -> u64 {
    10
}

fn default_error_backoff() -> u64 {
    5
}

fn default_max_signals() -> usize {
    1000
}

fn default_kill_switch_ttl() -> u64 {
    5
}

fn default_session_sensitive() -> Vec<AssetClass> {
    vec![AssetClass::Forex]
}

fn default_skip_sessions() -> Vec<TradingSession> {
    vec![TradingSession::Weekend, TradingSession::Sydney]
}

fn default_engine_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SCANNER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        check_scan_interval(self.scanner.default_interval_secs)
            .context("Invalid default_interval_secs")?;

        anyhow::ensure!(
            self.scanner.default_batch_size > 0,
            "default_batch_size must be greater than 0"
        );

        anyhow::ensure!(
            self.scanner.max_signals_per_cycle > 0,
            "max_signals_per_cycle must be greater than 0"
        );

        if let Some(timeout) = self.scanner.analysis_timeout_secs {
            anyhow::ensure!(timeout > 0, "analysis_timeout_secs must be greater than 0");
        }

        Ok(())
    }
}

/// Longest accepted scan interval: one week.
pub const MAX_SCAN_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Reject intervals the scan loop cannot wait out.
pub fn check_scan_interval(secs: u64) -> Result<()> {
    anyhow::ensure!(secs > 0, "interval must be greater than 0");
    anyhow::ensure!(
        secs <= MAX_SCAN_INTERVAL_SECS,
        "interval must be at most {MAX_SCAN_INTERVAL_SECS}s"
    );
    Ok(())
}

impl ScannerSettings {
    /// Config row written to a database that has none yet.
    pub fn seed_config(&self) -> ScannerConfig {
        ScannerConfig {
            scan_interval_secs: self.default_interval_secs,
            batch_size: self.default_batch_size,
            session_filter_enabled: self.default_session_filter,
            ..Default::default()
        }
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn analysis_timeout(&self) -> Option<Duration> {
        self.analysis_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_scan_interval(),
            default_batch_size: default_batch_size(),
            default_session_filter: true,
            batch_delay_ms: default_batch_delay_ms(),
            stop_grace_secs: default_stop_grace(),
            error_backoff_secs: default_error_backoff(),
            max_signals_per_cycle: default_max_signals(),
            analysis_timeout_secs: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            kill_switch_cache_secs: default_kill_switch_ttl(),
            fail_safe: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sensitive_assets: default_session_sensitive(),
            skip_sessions: default_skip_sessions(),
        }
    }
}
