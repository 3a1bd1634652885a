//! # Signal Scanner
//!
//! Periodically walks a watchlist of market symbols, asks an analysis engine
//! for trade signals and forwards them to subscribers, under kill-switch and
//! circuit-breaker control.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `analysis`: Analysis engine seam and HTTP adapter
//! - `scanner`: Scan cycle, session filter, safety gate, broadcaster, lifecycle
//! - `persistence`: SQLite-backed config, watchlist, history and safety flags

pub mod analysis;
pub mod config;
pub mod persistence;
pub mod scanner;

pub use config::Config;
pub use scanner::SignalScanner;
