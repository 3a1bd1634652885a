//! Signal Scanner - Main Entry Point
//!
//! Runs the scanner loop or manages its watchlist, history and safety flags.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use signal_scanner::analysis::{AnalysisEngine, HttpAnalysisEngine};
use signal_scanner::config::{check_scan_interval, Config};
use signal_scanner::persistence::{Repository, SqliteRepository};
use signal_scanner::scanner::{
    AssetClass, Broadcaster, CircuitBreaker, ConfigUpdate, CycleExecutor, KillSwitch, LogNotifier,
    SafetyGate, SessionFilter, SignalScanner, WatchlistSymbol,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Signal Scanner CLI
#[derive(Parser)]
#[command(name = "signal-scanner")]
#[command(version, about = "Autonomous watchlist scanner for trade signals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scanner until Ctrl+C or the kill switch
    Run,

    /// Show persisted scanner state
    Status,

    /// Manage watchlist symbols
    Watchlist {
        #[command(subcommand)]
        action: WatchlistAction,
    },

    /// Show recent scan cycles
    History {
        /// Number of cycles to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Turn the kill switch on or off
    KillSwitch {
        #[arg(value_enum)]
        state: Toggle,

        /// User id (defaults to safety.user_id)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Open or close the circuit breaker
    Breaker {
        #[arg(value_enum)]
        state: BreakerState,

        /// User id (defaults to safety.user_id)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Change persisted scanner settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum WatchlistAction {
    /// Add a symbol, or update it if already present
    Add {
        symbol: String,

        /// forex, crypto, stock, index or commodity
        #[arg(short, long, default_value = "crypto")]
        asset_class: AssetClass,

        #[arg(short, long, default_value = "1h")]
        timeframe: String,
    },
    /// Remove a symbol
    Remove { symbol: String },
    /// Resume scanning a symbol
    Enable { symbol: String },
    /// Stop scanning a symbol without removing it
    Disable { symbol: String },
    /// List all symbols
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Seconds between cycles and minimum rescan age per symbol
    SetInterval { seconds: u64 },
    /// Symbols per batch
    SetBatchSize { size: usize },
    /// Enable or disable the trading-session filter
    SessionFilter {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BreakerState {
    Open,
    Close,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_scanner(config).await,
        Commands::Status => show_status(&config).await,
        Commands::Watchlist { action } => manage_watchlist(&config, action),
        Commands::History { limit } => show_history(&config, limit),
        Commands::KillSwitch { state, user } => {
            let repo = open_repository(&config)?;
            let user = resolve_user(&config, user)?;
            repo.set_kill_switch(&user, state.enabled())?;
            println!("Kill switch for {} is now {}", user, if state.enabled() { "ON" } else { "OFF" });
            Ok(())
        }
        Commands::Breaker { state, user } => {
            let repo = open_repository(&config)?;
            let user = resolve_user(&config, user)?;
            let open = matches!(state, BreakerState::Open);
            repo.set_circuit_breaker(&user, open)?;
            println!("Circuit breaker for {} is now {}", user, if open { "OPEN" } else { "CLOSED" });
            Ok(())
        }
        Commands::Config { action } => update_config(&config, action).await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "scanner.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the whole process
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("signal_scanner=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn open_repository(config: &Config) -> Result<SqliteRepository> {
    SqliteRepository::open(&config.database.path, &config.scanner.seed_config())
}

fn resolve_user(config: &Config, user: Option<String>) -> Result<String> {
    user.or_else(|| config.safety.user_id.clone())
        .context("No user id given and safety.user_id is not configured")
}

async fn run_scanner(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Signal Scanner v{}                           ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let repo = Arc::new(open_repository(&config)?);

    let mut gate = SafetyGate::new(
        config.safety.user_id.clone(),
        config.safety.fail_safe,
        Duration::from_secs(config.safety.kill_switch_cache_secs),
    );
    if config.safety.user_id.is_some() {
        gate = gate
            .with_kill_switch(repo.clone())
            .with_circuit_breaker(repo.clone());
    } else {
        warn!("⚠️  No safety.user_id configured, kill switch and circuit breaker are inactive");
    }

    let engine: Option<Arc<dyn AnalysisEngine>> = match &config.engine.base_url {
        Some(url) => {
            info!("🔌 Analysis service: {}", url);
            Some(Arc::new(HttpAnalysisEngine::new(
                url,
                Duration::from_secs(config.engine.request_timeout_secs),
            )?))
        }
        None => {
            warn!("⚠️  No engine.base_url configured, every cycle will be skipped");
            None
        }
    };

    let executor = CycleExecutor::new(
        repo.clone(),
        engine,
        gate,
        SessionFilter::new(config.session.clone()),
        Broadcaster::new(Some(Arc::new(LogNotifier))),
        config.scanner.clone(),
    );
    let scanner = SignalScanner::new(executor, config.scanner.clone());

    scanner.start(true).await?;
    info!("🚀 Scanner running, press Ctrl+C to stop");

    let mut status_tick = tokio::time::interval(Duration::from_secs(60));
    status_tick.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
            _ = status_tick.tick() => {
                let status = scanner.get_status();
                if !status.is_running {
                    warn!("🛑 Scanner halted by kill switch");
                    break;
                }
                info!(
                    state = ?status.current_state,
                    next_scan_in = ?status.next_scan_in_seconds,
                    symbols = status.symbols_count,
                    "📊 Scanner status"
                );
            }
        }
    }

    scanner.stop().await?;
    info!("👋 Signal Scanner shutdown complete");
    Ok(())
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Database: {}", config.database.path);
    info!("   Batch Delay: {}ms", config.scanner.batch_delay_ms);
    info!("   Max Signals/Cycle: {}", config.scanner.max_signals_per_cycle);
    match config.scanner.analysis_timeout_secs {
        Some(secs) => info!("   Analysis Timeout: {}s", secs),
        None => info!("   Analysis Timeout: none"),
    }
    info!(
        "   Safety: user={:?}, fail_safe={}",
        config.safety.user_id, config.safety.fail_safe
    );
    info!(
        "   Session-sensitive: {:?}, skipped sessions: {:?}",
        config.session.sensitive_assets, config.session.skip_sessions
    );
}

async fn show_status(config: &Config) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              SIGNAL SCANNER STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !std::path::Path::new(&config.database.path).exists() {
        println!("\n❌ Database not found: {}", config.database.path);
        println!("   The scanner has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let repo = open_repository(config)?;
    let scanner_config = repo.get_config().await?;
    let symbols = repo.get_symbol_count().await?;

    let next_scan = match (scanner_config.is_running, scanner_config.last_cycle_at) {
        (true, Some(last)) => {
            let elapsed = (Utc::now() - last).num_seconds();
            format!("{}s", (scanner_config.scan_interval_secs as i64 - elapsed).max(0))
        }
        _ => "-".to_string(),
    };

    println!("\n📡 Scanner");
    println!("   ├─ Running:          {}", scanner_config.is_running);
    println!(
        "   ├─ Last Cycle:       {}",
        scanner_config
            .last_cycle_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("   ├─ Next Scan In:     {}", next_scan);
    println!("   ├─ Interval:         {}s", scanner_config.scan_interval_secs);
    println!("   ├─ Batch Size:       {}", scanner_config.batch_size);
    println!("   ├─ Session Filter:   {}", scanner_config.session_filter_enabled);
    println!("   └─ Enabled Symbols:  {}", symbols);

    if let Some(user) = &config.safety.user_id {
        println!("\n🛡️  Safety ({})", user);
        println!("   ├─ Kill Switch:      {}", repo.is_active(user).await?);
        println!("   └─ Circuit Breaker:  {}", repo.is_open(user).await?);
    }

    if let Some(last) = repo.recent_history(1)?.first() {
        println!("\n🕐 Last Cycle");
        println!("   ├─ Status:           {}", last.status);
        println!("   ├─ Scanned:          {}/{}", last.scanned, last.watchlist_size);
        println!("   ├─ Signals:          {}", last.signals_found);
        println!("   └─ Errors:           {}", last.errors);
    }

    Ok(())
}

fn manage_watchlist(config: &Config, action: WatchlistAction) -> Result<()> {
    let repo = open_repository(config)?;

    match action {
        WatchlistAction::Add {
            symbol,
            asset_class,
            timeframe,
        } => {
            let symbol = symbol.to_uppercase();
            repo.upsert_symbol(&WatchlistSymbol::new(&symbol, asset_class, &timeframe))?;
            println!("✅ {} ({}, {}) on watchlist", symbol, asset_class, timeframe);
        }
        WatchlistAction::Remove { symbol } => {
            report_symbol_change(&symbol, repo.remove_symbol(&symbol.to_uppercase())?, "removed");
        }
        WatchlistAction::Enable { symbol } => {
            report_symbol_change(
                &symbol,
                repo.set_symbol_enabled(&symbol.to_uppercase(), true)?,
                "enabled",
            );
        }
        WatchlistAction::Disable { symbol } => {
            report_symbol_change(
                &symbol,
                repo.set_symbol_enabled(&symbol.to_uppercase(), false)?,
                "disabled",
            );
        }
        WatchlistAction::List => {
            let symbols = repo.list_symbols()?;
            if symbols.is_empty() {
                println!("Watchlist is empty");
            }
            for s in symbols {
                println!(
                    "{} {:<12} {:<10} {:<5} last scanned: {}",
                    if s.enabled { "●" } else { "○" },
                    s.symbol,
                    s.asset_class,
                    s.timeframe,
                    s.last_scanned_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
    }
    Ok(())
}

fn report_symbol_change(symbol: &str, changed: bool, verb: &str) {
    if changed {
        println!("✅ {} {}", symbol.to_uppercase(), verb);
    } else {
        println!("❌ {} is not on the watchlist", symbol.to_uppercase());
    }
}

fn show_history(config: &Config, limit: usize) -> Result<()> {
    let repo = open_repository(config)?;
    let records = repo.recent_history(limit)?;

    if records.is_empty() {
        println!("No scan cycles recorded yet");
        return Ok(());
    }

    println!(
        "{:<20} {:<9} {:>6} {:>8} {:>8} {:>7} {:>7} {:>8}",
        "STARTED", "STATUS", "SIZE", "SCANNED", "SIGNALS", "ERRORS", "SKIPPED", "MS"
    );
    for r in records {
        println!(
            "{:<20} {:<9} {:>6} {:>8} {:>8} {:>7} {:>7} {:>8}{}",
            r.started_at.format("%Y-%m-%d %H:%M:%S"),
            r.status,
            r.watchlist_size,
            r.scanned,
            r.signals_found,
            r.errors,
            r.skipped_session + r.skipped_rate_limit,
            r.duration_ms,
            r.error_message
                .map(|m| format!("  ({})", m))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn update_config(config: &Config, action: ConfigAction) -> Result<()> {
    let repo = open_repository(config)?;

    let update = match action {
        ConfigAction::SetInterval { seconds } => {
            check_scan_interval(seconds)?;
            ConfigUpdate {
                scan_interval_secs: Some(seconds),
                ..Default::default()
            }
        }
        ConfigAction::SetBatchSize { size } => {
            anyhow::ensure!(size > 0, "batch size must be greater than 0");
            ConfigUpdate {
                batch_size: Some(size),
                ..Default::default()
            }
        }
        ConfigAction::SessionFilter { state } => ConfigUpdate {
            session_filter_enabled: Some(state.enabled()),
            ..Default::default()
        },
    };

    repo.update_config(update).await?;
    let current = repo.get_config().await?;
    println!(
        "✅ interval={}s batch_size={} session_filter={} (applies on next start)",
        current.scan_interval_secs, current.batch_size, current.session_filter_enabled
    );
    Ok(())
}
