//! Outbound notifications.
//!
//! The [`Broadcaster`] turns scanner events into [`Notification`] payloads and
//! hands them to an optional [`Notifier`]. Delivery is best effort: failures
//! are counted and logged, never returned to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::analysis::{Direction, TradeSignal};

/// Why the scanner's running state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    Started,
    Stopped,
    KillSwitch,
}

/// Payload of a "signal detected" message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalDetected {
    pub id: String,
    pub symbol: String,
    pub pattern: String,
    pub direction: Direction,
    pub confidence: f64,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub timeframe: String,
    pub source: &'static str,
    pub detected_at: DateTime<Utc>,
}

impl From<&TradeSignal> for SignalDetected {
    fn from(signal: &TradeSignal) -> Self {
        Self {
            id: signal.correlation_id.clone(),
            symbol: signal.symbol.clone(),
            pattern: signal.pattern.clone(),
            direction: Direction::of(signal),
            confidence: signal.confidence,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            timeframe: signal.timeframe.clone(),
            source: "scanner",
            detected_at: signal.detected_at,
        }
    }
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    SignalDetected(SignalDetected),
    ScannerStatusChanged { is_running: bool, event: StatusEvent },
}

/// Delivery channel for notifications (websocket hub, queue, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn broadcast(&self, message: &Notification) -> anyhow::Result<()>;
}

/// Best-effort event publisher.
#[derive(Clone, Default)]
pub struct Broadcaster {
    notifier: Option<Arc<dyn Notifier>>,
    failures: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new(notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            notifier,
            failures: Arc::new(AtomicU64::new(0)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Broadcaster without a channel; every call is a no-op.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub async fn signal_detected(&self, signal: &TradeSignal) {
        self.send(Notification::SignalDetected(signal.into())).await;
    }

    pub async fn status_changed(&self, is_running: bool, event: StatusEvent) {
        self.send(Notification::ScannerStatusChanged { is_running, event })
            .await;
    }

    /// Number of messages the notifier rejected.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    async fn send(&self, message: Notification) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        match notifier.broadcast(&message).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, failures, "Failed to broadcast notification");
            }
        }
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn broadcast(&self, message: &Notification) -> anyhow::Result<()> {
        match self.tx.send(message.clone()) {
            Ok(receivers) => {
                debug!(receivers, "Notification queued");
                Ok(())
            }
            Err(_) => anyhow::bail!("no active subscribers"),
        }
    }
}

/// Writes each notification as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn broadcast(&self, message: &Notification) -> anyhow::Result<()> {
        let json = serde_json::to_string(message)?;
        info!(target: "scanner_notify", "NOTIFY: {}", json);
        Ok(())
    }
}
