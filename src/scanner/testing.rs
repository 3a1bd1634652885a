//! Test doubles shared by the scanner unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use super::broadcaster::{Notification, Notifier};
use super::types::{
    AssetClass, ConfigUpdate, CycleHistoryRecord, ScannerConfig, WatchlistSymbol,
};
use crate::analysis::{AnalysisEngine, AnalysisError, TradeSignal};
use crate::persistence::{Repository, SqliteRepository};

type Script = dyn Fn(&str, usize) -> Result<Vec<TradeSignal>, AnalysisError> + Send + Sync;

/// `n` crypto symbols named SYM0..SYMn, never scanned.
pub fn crypto_watchlist(n: usize) -> Vec<WatchlistSymbol> {
    (0..n)
        .map(|i| WatchlistSymbol::new(&format!("SYM{i}"), AssetClass::Crypto, "1h"))
        .collect()
}

pub fn signal(symbol: &str, index: usize) -> TradeSignal {
    TradeSignal {
        symbol: symbol.to_string(),
        pattern: "double_bottom".to_string(),
        confidence: 0.8,
        entry_price: dec!(100),
        stop_loss: dec!(95),
        take_profit: dec!(110),
        correlation_id: format!("{symbol}-{index}"),
        timeframe: "1h".to_string(),
        detected_at: Utc::now(),
    }
}

/// Engine whose answers come from a closure. Records every call in order.
pub struct ScriptedEngine {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
    stall_on: Option<String>,
    latency: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&str, usize) -> Result<Vec<TradeSignal>, AnalysisError> + Send + Sync + 'static,
    {
        Arc::new(Self::unwrapped(script))
    }

    fn unwrapped<F>(script: F) -> Self
    where
        F: Fn(&str, usize) -> Result<Vec<TradeSignal>, AnalysisError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            cancel_after: None,
            stall_on: None,
            latency: None,
        }
    }

    /// Every call returns `per_call` signals.
    pub fn returning_signals(per_call: usize) -> Arc<Self> {
        Self::new(move |symbol, _| Ok((0..per_call).map(|i| signal(symbol, i)).collect()))
    }

    /// Cancel `token` once `calls` analyses have completed.
    pub fn cancel_after(self: Arc<Self>, calls: usize, token: CancellationToken) -> Arc<Self> {
        let mut engine = Arc::into_inner(self).expect("engine already shared");
        engine.cancel_after = Some((calls, token));
        Arc::new(engine)
    }

    /// Never answer for `symbol`.
    pub fn stall_on(self: Arc<Self>, symbol: &str) -> Arc<Self> {
        let mut engine = Arc::into_inner(self).expect("engine already shared");
        engine.stall_on = Some(symbol.to_string());
        Arc::new(engine)
    }

    /// Take `latency` to answer every call.
    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        let mut engine = Arc::into_inner(self).expect("engine already shared");
        engine.latency = Some(latency);
        Arc::new(engine)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedEngine {
    async fn analyze(
        &self,
        symbol: &str,
        _timeframe: &str,
    ) -> Result<Vec<TradeSignal>, AnalysisError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(symbol.to_string());
            calls.len()
        };

        if self.stall_on.as_deref() == Some(symbol) {
            std::future::pending::<()>().await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = (self.script)(symbol, index - 1);

        if let Some((limit, token)) = &self.cancel_after {
            if index >= *limit {
                token.cancel();
            }
        }
        result
    }
}

/// SQLite repository in memory, with switchable failures.
pub struct TestRepository {
    pub inner: SqliteRepository,
    fail_watchlist: AtomicBool,
    fail_history: AtomicBool,
}

impl TestRepository {
    pub fn with_symbols(symbols: &[WatchlistSymbol]) -> Arc<Self> {
        Self::with_config(&ScannerConfig::default(), symbols)
    }

    pub fn with_config(config: &ScannerConfig, symbols: &[WatchlistSymbol]) -> Arc<Self> {
        let inner = SqliteRepository::in_memory(config).unwrap();
        for symbol in symbols {
            inner.upsert_symbol(symbol).unwrap();
        }
        Arc::new(Self {
            inner,
            fail_watchlist: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
        })
    }

    pub fn fail_watchlist(&self, fail: bool) {
        self.fail_watchlist.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// History rows, oldest first.
    pub fn history(&self) -> Vec<CycleHistoryRecord> {
        let mut rows = self.inner.recent_history(1000).unwrap();
        rows.reverse();
        rows
    }
}

#[async_trait]
impl Repository for TestRepository {
    async fn get_config(&self) -> Result<ScannerConfig> {
        self.inner.get_config().await
    }

    async fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        self.inner.update_config(update).await
    }

    async fn get_symbol_count(&self) -> Result<usize> {
        self.inner.get_symbol_count().await
    }

    async fn get_enabled_symbols(&self) -> Result<Vec<WatchlistSymbol>> {
        if self.fail_watchlist.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inner.get_enabled_symbols().await
    }

    async fn update_last_scanned(&self, symbol: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.update_last_scanned(symbol, at).await
    }

    async fn set_last_cycle_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_last_cycle_at(at).await
    }

    async fn add_history(&self, record: &CycleHistoryRecord) -> Result<()> {
        if self.fail_history.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.add_history(record).await
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Notification> {
        self.messages.lock().unwrap().clone()
    }

    pub fn signal_ids(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Notification::SignalDetected(payload) => Some(payload.id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn broadcast(&self, message: &Notification) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Collects log messages emitted on the current thread.
#[derive(Clone, Default)]
pub struct LogCounter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl LogCounter {
    /// Install as the thread's default subscriber until the guard drops.
    pub fn install() -> (Self, DefaultGuard) {
        let counter = Self::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (counter, guard)
    }

    /// Number of events whose message contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.messages.lock().unwrap().push(visitor.0);
    }
}
