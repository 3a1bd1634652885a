//! One pass over the watchlist.
//!
//! Order of checks for a cycle:
//! 1. kill switch, then circuit breaker (either one skips the cycle)
//! 2. analysis engine attached
//! 3. enabled watchlist, split into batches
//!
//! and for each symbol: cancellation, cached kill switch, session filter,
//! rate limit, then the engine call. A failing symbol is counted and the cycle
//! moves on; repository failures abort the cycle and are returned to the
//! caller after a FAILED history row has been attempted.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::broadcaster::Broadcaster;
use super::safety::{KillSwitchCache, SafetyGate};
use super::session::{should_skip_for_rate_limit, SessionFilter};
use super::types::{CycleStatus, ScanCycleResult, ScannerConfig, WatchlistSymbol};
use crate::analysis::{AnalysisEngine, AnalysisError, TradeSignal};
use crate::config::ScannerSettings;
use crate::persistence::Repository;

/// Runs scan cycles against a fixed set of collaborators.
pub struct CycleExecutor {
    repository: Arc<dyn Repository>,
    engine: Option<Arc<dyn AnalysisEngine>>,
    gate: SafetyGate,
    sessions: SessionFilter,
    broadcaster: Broadcaster,
    settings: ScannerSettings,
}

impl CycleExecutor {
    pub fn new(
        repository: Arc<dyn Repository>,
        engine: Option<Arc<dyn AnalysisEngine>>,
        gate: SafetyGate,
        sessions: SessionFilter,
        broadcaster: Broadcaster,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            repository,
            engine,
            gate,
            sessions,
            broadcaster,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Run one cycle and record it in history.
    ///
    /// Exactly one history row is written per call. An `Err` means the cycle
    /// hit an infrastructure failure; its FAILED row has already been
    /// attempted.
    pub async fn run(
        &self,
        config: &ScannerConfig,
        cancel: &CancellationToken,
    ) -> Result<ScanCycleResult> {
        let mut result = ScanCycleResult::begin();
        let span = info_span!("scan_cycle", cycle_id = %result.cycle_id);

        async move {
            // Fresh cache every cycle
            let mut kill_switch_cache = KillSwitchCache::new();
            let outcome = self
                .execute(config, cancel, &mut kill_switch_cache, &mut result)
                .await;
            result.finished_at = Some(Utc::now());

            match outcome {
                Ok(()) => {
                    let recorded = self
                        .repository
                        .add_history(&result.to_history())
                        .await
                        .context("Failed to record cycle history");
                    log_summary(&result);

                    match recorded {
                        Ok(()) => Ok(result),
                        // The halt must still reach the loop
                        Err(e) if result.kill_switch_triggered => {
                            error!(error = %e, "Failed to record kill-switch cycle");
                            Ok(result)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => {
                    result.status = CycleStatus::Failed;
                    result.error_message = Some(format!("{e:#}"));
                    if let Err(history_err) =
                        self.repository.add_history(&result.to_history()).await
                    {
                        error!(error = %history_err, "Failed to record failed cycle");
                    }
                    error!(error = %e, "Scan cycle aborted");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        config: &ScannerConfig,
        cancel: &CancellationToken,
        kill_switch_cache: &mut KillSwitchCache,
        result: &mut ScanCycleResult,
    ) -> Result<()> {
        if self.gate.check_kill_switch(kill_switch_cache).await {
            warn!("Kill switch active, skipping cycle");
            result.kill_switch_triggered = true;
            result.status = CycleStatus::Skipped;
            return Ok(());
        }

        if self.gate.check_circuit_breaker().await {
            warn!("Circuit breaker open, skipping cycle");
            result.status = CycleStatus::Skipped;
            return Ok(());
        }

        let Some(engine) = self.engine.as_deref() else {
            warn!("No analysis engine attached, skipping cycle");
            result.status = CycleStatus::Skipped;
            return Ok(());
        };

        let symbols = self
            .repository
            .get_enabled_symbols()
            .await
            .context("Failed to load watchlist")?;
        result.watchlist_size = symbols.len();

        if symbols.is_empty() {
            info!("Watchlist is empty");
            result.status = CycleStatus::Completed;
            return Ok(());
        }

        let batch_size = config.batch_size.max(1);
        let interval = i64::try_from(config.scan_interval_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .with_context(|| {
                format!("Scan interval of {}s is out of range", config.scan_interval_secs)
            })?;
        result.batches = symbols.len().div_ceil(batch_size);

        let mut interrupted = false;

        'batches: for (index, batch) in symbols.chunks(batch_size).enumerate() {
            if index > 0 {
                // Bound the external call rate between batches
                tokio::select! {
                    _ = cancel.cancelled() => {
                        interrupted = true;
                        break 'batches;
                    }
                    _ = tokio::time::sleep(self.settings.batch_delay()) => {}
                }
            }

            debug!(batch = index + 1, size = batch.len(), "Processing batch");

            for symbol in batch {
                if cancel.is_cancelled() {
                    info!(symbol = %symbol.symbol, "Cancellation requested, ending cycle early");
                    interrupted = true;
                    break 'batches;
                }

                if self.gate.check_kill_switch(kill_switch_cache).await {
                    warn!(symbol = %symbol.symbol, "Kill switch activated mid-cycle, aborting");
                    result.kill_switch_triggered = true;
                    interrupted = true;
                    break 'batches;
                }

                self.process_symbol(engine, symbol, config, interval, result)
                    .await?;
            }
        }

        result.status = derive_status(result, interrupted);
        Ok(())
    }

    async fn process_symbol(
        &self,
        engine: &dyn AnalysisEngine,
        symbol: &WatchlistSymbol,
        config: &ScannerConfig,
        interval: ChronoDuration,
        result: &mut ScanCycleResult,
    ) -> Result<()> {
        let now = Utc::now();

        if config.session_filter_enabled {
            let (skip, reason) = self.sessions.check(symbol.asset_class, now, true);
            if skip {
                debug!(symbol = %symbol.symbol, %reason, "Skipped by session filter");
                result.skipped_session += 1;
                return Ok(());
            }
        }

        let (skip, reason) = should_skip_for_rate_limit(symbol.last_scanned_at, interval, now);
        if skip {
            debug!(symbol = %symbol.symbol, %reason, "Skipped by rate limit");
            result.skipped_rate_limit += 1;
            return Ok(());
        }

        result.scanned += 1;

        match self.analyze(engine, symbol).await {
            Ok(signals) => {
                self.repository
                    .update_last_scanned(&symbol.symbol, Utc::now())
                    .await
                    .with_context(|| format!("Failed to update last scan time for {}", symbol.symbol))?;

                if !signals.is_empty() {
                    info!(symbol = %symbol.symbol, count = signals.len(), "Signals detected");
                }
                for signal in signals {
                    self.broadcaster.signal_detected(&signal).await;
                    self.retain_signal(signal, result);
                }
            }
            Err(e) if e.is_no_data() => {
                debug!(symbol = %symbol.symbol, timeframe = %symbol.timeframe, "No data");
                result.no_data += 1;
            }
            Err(e) => {
                warn!(symbol = %symbol.symbol, error = %e, "Analysis failed");
                result.errors += 1;
            }
        }

        Ok(())
    }

    async fn analyze(
        &self,
        engine: &dyn AnalysisEngine,
        symbol: &WatchlistSymbol,
    ) -> Result<Vec<TradeSignal>, AnalysisError> {
        // A panicking engine counts as a failed symbol
        let call = AssertUnwindSafe(engine.analyze(&symbol.symbol, &symbol.timeframe))
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|panic| Err(engine_panic(panic))));
        match self.settings.analysis_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(AnalysisError::TimedOut(limit))),
            None => call.await,
        }
    }

    fn retain_signal(&self, signal: TradeSignal, result: &mut ScanCycleResult) {
        result.signals_found += 1;

        if result.signals.len() < self.settings.max_signals_per_cycle {
            result.correlation_ids.push(signal.correlation_id.clone());
            result.signals.push(signal);
        } else if !result.signals_truncated {
            warn!(
                limit = self.settings.max_signals_per_cycle,
                "Signal limit reached, dropping further signals this cycle"
            );
            result.signals_truncated = true;
        }
    }
}

fn engine_panic(panic: Box<dyn Any + Send>) -> AnalysisError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    AnalysisError::Failed(anyhow!("analysis engine panicked: {message}"))
}

/// Final status from the counts of a cycle that ran past the safety gates.
pub fn derive_status(result: &ScanCycleResult, interrupted: bool) -> CycleStatus {
    let skipped = result.skipped_session + result.skipped_rate_limit;

    if interrupted {
        CycleStatus::Partial
    } else if result.scanned > 0 && result.errors == result.scanned {
        CycleStatus::Failed
    } else if result.errors > 0 {
        CycleStatus::Partial
    } else if result.scanned == 0 && skipped > 0 {
        CycleStatus::Filtered
    } else {
        CycleStatus::Completed
    }
}

fn log_summary(result: &ScanCycleResult) {
    info!(
        status = %result.status,
        watchlist = result.watchlist_size,
        batches = result.batches,
        scanned = result.scanned,
        signals = result.signals_found,
        retained = result.signals.len(),
        errors = result.errors,
        no_data = result.no_data,
        skipped_session = result.skipped_session,
        skipped_rate_limit = result.skipped_rate_limit,
        kill_switch = result.kill_switch_triggered,
        duration_ms = result.duration_ms(),
        "Scan cycle finished"
    );
}
