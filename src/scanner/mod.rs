//! Watchlist scanning.
//!
//! - `types`: watchlist, config and cycle result types
//! - `session`: trading-session and rate-limit rules
//! - `safety`: kill switch and circuit breaker gate
//! - `broadcaster`: outbound notifications
//! - `cycle`: one pass over the watchlist
//! - `lifecycle`: background loop and start/stop state machine

mod broadcaster;
mod cycle;
mod lifecycle;
mod safety;
mod session;
mod types;

#[cfg(test)]
mod testing;

pub use broadcaster::{
    Broadcaster, ChannelNotifier, LogNotifier, Notification, Notifier, SignalDetected,
    StatusEvent,
};
pub use cycle::{derive_status, CycleExecutor};
pub use lifecycle::{DisplayState, ScannerState, ScannerStatus, SignalScanner};
pub use safety::{CircuitBreaker, KillSwitch, KillSwitchCache, SafetyGate};
pub use session::{
    current_session, should_skip_for_rate_limit, should_skip_for_session, SessionFilter,
    TradingSession,
};
pub use types::{
    AssetClass, ConfigUpdate, CycleHistoryRecord, CycleStatus, ScanCycleResult, ScannerConfig,
    WatchlistSymbol,
};
