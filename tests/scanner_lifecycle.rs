//! End-to-end scanner runs against an in-memory SQLite database.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use signal_scanner::analysis::{AnalysisEngine, AnalysisError, TradeSignal};
use signal_scanner::config::{ScannerSettings, SessionConfig};
use signal_scanner::persistence::{Repository, SqliteRepository};
use signal_scanner::scanner::{
    AssetClass, Broadcaster, ChannelNotifier, CycleExecutor, CycleStatus, Notification,
    SafetyGate, ScannerState, SessionFilter, SignalScanner, StatusEvent, WatchlistSymbol,
};
use std::sync::Arc;
use std::time::Duration;

/// Emits one bullish signal per symbol, no data for anything ending in "X".
struct StaticEngine;

#[async_trait]
impl AnalysisEngine for StaticEngine {
    async fn analyze(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<TradeSignal>, AnalysisError> {
        if symbol.ends_with('X') {
            return Err(AnalysisError::no_data(symbol, timeframe));
        }
        Ok(vec![TradeSignal {
            symbol: symbol.to_string(),
            pattern: "bull_flag".to_string(),
            confidence: 0.75,
            entry_price: dec!(100),
            stop_loss: dec!(97),
            take_profit: dec!(108),
            correlation_id: format!("{symbol}-sig"),
            timeframe: timeframe.to_string(),
            detected_at: Utc::now(),
        }])
    }
}

fn settings() -> ScannerSettings {
    ScannerSettings {
        batch_delay_ms: 0,
        ..Default::default()
    }
}

fn repository() -> Arc<SqliteRepository> {
    let repo = SqliteRepository::in_memory(&settings().seed_config()).unwrap();
    for (symbol, class) in [
        ("BTCUSD", AssetClass::Crypto),
        ("ETHUSD", AssetClass::Crypto),
        ("SPX", AssetClass::Index),
    ] {
        repo.upsert_symbol(&WatchlistSymbol::new(symbol, class, "1h"))
            .unwrap();
    }
    Arc::new(repo)
}

fn scanner(repo: Arc<SqliteRepository>, channel: ChannelNotifier) -> SignalScanner {
    let gate = SafetyGate::new(Some("desk-1".to_string()), true, Duration::from_secs(5))
        .with_kill_switch(repo.clone())
        .with_circuit_breaker(repo.clone());
    let executor = CycleExecutor::new(
        repo,
        Some(Arc::new(StaticEngine)),
        gate,
        SessionFilter::new(SessionConfig::default()),
        Broadcaster::new(Some(Arc::new(channel))),
        settings(),
    );
    SignalScanner::new(executor, settings())
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_broadcasts_and_records() {
    let repo = repository();
    let channel = ChannelNotifier::new(64);
    let mut rx = channel.subscribe();
    let scanner = scanner(repo.clone(), channel);

    scanner.start(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let history = repo.recent_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CycleStatus::Completed);
    assert_eq!(history[0].scanned, 3);
    assert_eq!(history[0].signals_found, 2);
    assert_eq!(history[0].no_data, 1);

    scanner.stop().await.unwrap();
    assert_eq!(scanner.state(), ScannerState::Stopped);
    assert!(!repo.get_config().await.unwrap().is_running);

    let mut signal_ids = Vec::new();
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        match message {
            Notification::SignalDetected(payload) => signal_ids.push(payload.id),
            Notification::ScannerStatusChanged { event, .. } => events.push(event),
        }
    }
    // SPX ends with X: no data, so no signal
    assert_eq!(signal_ids, vec!["BTCUSD-sig", "ETHUSD-sig"]);
    assert_eq!(events, vec![StatusEvent::Started, StatusEvent::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_skips_cycle_but_loop_continues() {
    let repo = repository();
    repo.set_circuit_breaker("desk-1", true).unwrap();
    let channel = ChannelNotifier::new(64);
    let _rx = channel.subscribe();
    let scanner = scanner(repo.clone(), channel);

    scanner.start(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(scanner.state(), ScannerState::Running);
    let history = repo.recent_history(10).unwrap();
    assert_eq!(history[0].status, CycleStatus::Skipped);
    assert!(!history[0].kill_switch_triggered);

    scanner.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_kill_switch_halts_running_scanner() {
    let repo = repository();
    let channel = ChannelNotifier::new(64);
    let mut rx = channel.subscribe();
    let scanner = scanner(repo.clone(), channel);

    scanner.start(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(scanner.state(), ScannerState::Running);

    repo.set_kill_switch("desk-1", true).unwrap();
    // next cycle after the 300s interval sees the switch
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(scanner.state(), ScannerState::Stopped);
    assert!(!repo.get_config().await.unwrap().is_running);

    let history = repo.recent_history(10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].kill_switch_triggered);

    let mut last_event = None;
    while let Ok(message) = rx.try_recv() {
        if let Notification::ScannerStatusChanged { event, is_running } = message {
            last_event = Some((event, is_running));
        }
    }
    assert_eq!(last_event, Some((StatusEvent::KillSwitch, false)));
}
