//! Scanner lifecycle: one background loop, started and stopped on demand.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broadcaster::StatusEvent;
use super::cycle::CycleExecutor;
use super::types::{ConfigUpdate, ScannerConfig};
use crate::config::ScannerSettings;

/// Lifecycle state. STARTING and STOPPING only exist while `start()` or
/// `stop()` is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shown to operators, derived from the lifecycle flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayState {
    Stopped,
    Starting,
    Stopping,
    Scanning,
    Waiting,
}

/// Point-in-time snapshot returned by [`SignalScanner::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannerStatus {
    pub is_running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub next_scan_in_seconds: Option<i64>,
    pub scan_interval_seconds: u64,
    pub current_state: DisplayState,
    pub symbols_count: usize,
}

#[derive(Debug)]
struct Lifecycle {
    state: ScannerState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    is_scanning: bool,
    last_cycle_at: Option<DateTime<Utc>>,
    scan_interval_secs: u64,
    symbols_count: usize,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ScannerState::Stopped,
            cancel: CancellationToken::new(),
            handle: None,
            is_scanning: false,
            last_cycle_at: None,
            scan_interval_secs: ScannerConfig::default().scan_interval_secs,
            symbols_count: 0,
        }
    }
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Periodic signal scanner.
pub struct SignalScanner {
    executor: Arc<CycleExecutor>,
    settings: ScannerSettings,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl SignalScanner {
    pub fn new(executor: CycleExecutor, settings: ScannerSettings) -> Self {
        Self {
            executor: Arc::new(executor),
            settings,
            lifecycle: Arc::new(Mutex::new(Lifecycle::new())),
        }
    }

    pub fn state(&self) -> ScannerState {
        lock(&self.lifecycle).state
    }

    /// Start the background loop. Does nothing unless the scanner is stopped.
    pub async fn start(&self, broadcast: bool) -> Result<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != ScannerState::Stopped {
                debug!(state = ?lifecycle.state, "Scanner already active, ignoring start");
                return Ok(());
            }
            lifecycle.state = ScannerState::Starting;
        }

        let config = match self.prepare().await {
            Ok(config) => config,
            Err(e) => {
                lock(&self.lifecycle).state = ScannerState::Stopped;
                error!(error = %e, "Failed to start scanner");
                return Err(e);
            }
        };

        {
            let mut lifecycle = lock(&self.lifecycle);
            let cancel = CancellationToken::new();
            lifecycle.cancel = cancel.clone();
            lifecycle.scan_interval_secs = config.scan_interval_secs;
            lifecycle.last_cycle_at = config.last_cycle_at;
            lifecycle.is_scanning = false;
            lifecycle.handle = Some(tokio::spawn(run_loop(
                self.executor.clone(),
                self.lifecycle.clone(),
                config.clone(),
                self.settings.clone(),
                cancel,
            )));
            lifecycle.state = ScannerState::Running;
        }

        info!(
            interval_secs = config.scan_interval_secs,
            batch_size = config.batch_size,
            session_filter = config.session_filter_enabled,
            "Scanner started"
        );

        if broadcast {
            self.executor
                .broadcaster()
                .status_changed(true, StatusEvent::Started)
                .await;
        }
        Ok(())
    }

    async fn prepare(&self) -> Result<ScannerConfig> {
        let repository = self.executor.repository();
        let config = repository
            .get_config()
            .await
            .context("Failed to load scanner config")?;
        let symbols_count = repository
            .get_symbol_count()
            .await
            .context("Failed to count watchlist symbols")?;
        repository
            .update_config(ConfigUpdate::running(true))
            .await
            .context("Failed to persist running flag")?;

        lock(&self.lifecycle).symbols_count = symbols_count;
        Ok(config)
    }

    /// Stop the loop, waiting up to the grace period before aborting it.
    /// Does nothing unless the scanner is running.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, handle) = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                ScannerState::Stopped | ScannerState::Starting | ScannerState::Stopping => {
                    debug!(state = ?lifecycle.state, "Scanner not running, ignoring stop");
                    return Ok(());
                }
                ScannerState::Running => {}
            }
            lifecycle.state = ScannerState::Stopping;
            (lifecycle.cancel.clone(), lifecycle.handle.take())
        };

        info!("Stopping scanner");
        cancel.cancel();

        if let Some(mut handle) = handle {
            let grace = self.settings.stop_grace();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "Scan loop did not exit in time, aborting");
                handle.abort();
                // Resolves once the abort has unwound the task
                let _ = handle.await;
            }
        }

        let persisted = self
            .executor
            .repository()
            .update_config(ConfigUpdate::running(false))
            .await;

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.state = ScannerState::Stopped;
            lifecycle.is_scanning = false;
        }
        info!("Scanner stopped");

        self.executor
            .broadcaster()
            .status_changed(false, StatusEvent::Stopped)
            .await;

        persisted.context("Failed to persist running flag")
    }

    pub fn get_status(&self) -> ScannerStatus {
        self.status_at(Utc::now())
    }

    fn status_at(&self, now: DateTime<Utc>) -> ScannerStatus {
        let lifecycle = lock(&self.lifecycle);
        let loop_alive = lifecycle
            .handle
            .as_ref()
            .map_or(true, |handle| !handle.is_finished());
        let is_running = lifecycle.state == ScannerState::Running && loop_alive;

        let current_state = match lifecycle.state {
            ScannerState::Stopped => DisplayState::Stopped,
            ScannerState::Starting => DisplayState::Starting,
            ScannerState::Stopping => DisplayState::Stopping,
            ScannerState::Running if !loop_alive => DisplayState::Stopped,
            ScannerState::Running if lifecycle.is_scanning => DisplayState::Scanning,
            ScannerState::Running => DisplayState::Waiting,
        };

        let next_scan_in_seconds = match (is_running, lifecycle.last_cycle_at) {
            (true, Some(last)) => {
                let elapsed = (now - last).num_seconds();
                Some((lifecycle.scan_interval_secs as i64 - elapsed).max(0))
            }
            _ => None,
        };

        ScannerStatus {
            is_running,
            last_cycle_at: lifecycle.last_cycle_at,
            next_scan_in_seconds,
            scan_interval_seconds: lifecycle.scan_interval_secs,
            current_state,
            symbols_count: lifecycle.symbols_count,
        }
    }
}

async fn run_loop(
    executor: Arc<CycleExecutor>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    config: ScannerConfig,
    settings: ScannerSettings,
    cancel: CancellationToken,
) {
    let interval = std::time::Duration::from_secs(config.scan_interval_secs);
    debug!(interval_secs = config.scan_interval_secs, "Scan loop running");

    while !cancel.is_cancelled() {
        lock(&lifecycle).is_scanning = true;
        let outcome = executor.run(&config, &cancel).await;
        lock(&lifecycle).is_scanning = false;

        let wait = match outcome {
            Ok(result) if result.kill_switch_triggered => {
                warn!(cycle_id = %result.cycle_id, "Kill switch triggered, shutting scanner down");
                halt_for_kill_switch(&executor, &lifecycle).await;
                return;
            }
            Ok(_) => {
                let now = Utc::now();
                lock(&lifecycle).last_cycle_at = Some(now);
                if let Err(e) = executor.repository().set_last_cycle_at(now).await {
                    error!(error = %e, "Failed to persist last cycle time");
                }
                interval
            }
            Err(e) => {
                error!(
                    error = %e,
                    backoff_secs = settings.error_backoff().as_secs(),
                    "Scan cycle failed, backing off"
                );
                settings.error_backoff()
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!("Scan loop exited");
}

/// Teardown performed by the loop itself; `stop()` is not called from here.
async fn halt_for_kill_switch(executor: &CycleExecutor, lifecycle: &Mutex<Lifecycle>) {
    if let Err(e) = executor
        .repository()
        .update_config(ConfigUpdate::running(false))
        .await
    {
        error!(error = %e, "Failed to persist running flag after kill switch");
    }

    let halted = {
        let mut lifecycle = lock(lifecycle);
        lifecycle.handle = None;
        if lifecycle.state == ScannerState::Running {
            lifecycle.state = ScannerState::Stopped;
            true
        } else {
            false
        }
    };

    if halted {
        executor
            .broadcaster()
            .status_changed(false, StatusEvent::KillSwitch)
            .await;
    }
}
