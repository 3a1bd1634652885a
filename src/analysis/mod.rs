//! Analysis engine seam.
//!
//! The scanner does not detect patterns itself. It hands each watchlist
//! symbol to an [`AnalysisEngine`] and collects the [`TradeSignal`]s it
//! returns. "No data" is reported as its own error variant so the cycle can
//! count it apart from genuine failures.

mod http;

pub use http::HttpAnalysisEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A trade setup produced by the analysis engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    /// Pattern name as reported by the engine (e.g. "bullish_engulfing")
    pub pattern: String,
    /// Engine confidence (0.0-1.0)
    pub confidence: f64,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Identifier that ties the signal to downstream records
    pub correlation_id: String,
    pub timeframe: String,
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
}

/// Trade direction implied by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Derive direction from the words of the pattern name, falling back to
    /// the price levels when no word carries a directional hint.
    ///
    /// Words are split on anything that is not alphanumeric and matched by
    /// prefix, so "bullish" counts as "bull" but "stop" never counts as "top".
    pub fn of(signal: &TradeSignal) -> Self {
        const SHORT_STEMS: &[&str] = &["bear", "top", "descending", "short"];
        const LONG_STEMS: &[&str] = &["bull", "bottom", "ascending", "long"];

        let pattern = signal.pattern.to_lowercase();
        let words: Vec<&str> = pattern
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        let has_word = |target: &str| words.iter().any(|word| *word == target);
        let has_stem = |stems: &[&str]| {
            words
                .iter()
                .any(|word| stems.iter().any(|stem| word.starts_with(stem)))
        };
        let wedge = |side: &str| {
            words
                .windows(2)
                .any(|pair| pair[0] == side && pair[1] == "wedge")
        };

        // "inverse_head_and_shoulders" is bullish, the plain variant bearish
        if has_word("head") && has_word("shoulders") {
            return if has_word("inverse") {
                Direction::Long
            } else {
                Direction::Short
            };
        }

        if wedge("rising") || has_stem(SHORT_STEMS) {
            Direction::Short
        } else if wedge("falling") || has_stem(LONG_STEMS) {
            Direction::Long
        } else if signal.take_profit < signal.entry_price {
            Direction::Short
        } else {
            Direction::Long
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// Failure modes of a single analysis call.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The engine had no market data for the symbol/timeframe.
    #[error("no market data for {symbol} ({timeframe})")]
    NoData { symbol: String, timeframe: String },

    /// The call exceeded the configured analysis timeout.
    #[error("analysis timed out after {0:?}")]
    TimedOut(Duration),

    /// Anything else.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl AnalysisError {
    pub fn no_data(symbol: &str, timeframe: &str) -> Self {
        AnalysisError::NoData {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, AnalysisError::NoData { .. })
    }
}

/// External pattern-detection engine.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Analyse one symbol on one timeframe and return every signal found.
    async fn analyze(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<TradeSignal>, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal(pattern: &str, entry: Decimal, target: Decimal) -> TradeSignal {
        TradeSignal {
            symbol: "EURUSD".to_string(),
            pattern: pattern.to_string(),
            confidence: 0.8,
            entry_price: entry,
            stop_loss: dec!(1.0),
            take_profit: target,
            correlation_id: "corr-1".to_string(),
            timeframe: "1h".to_string(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_direction_from_pattern_name() {
        assert_eq!(
            Direction::of(&signal("bullish_engulfing", dec!(1.1), dec!(1.0))),
            Direction::Long
        );
        assert_eq!(
            Direction::of(&signal("double_top", dec!(1.0), dec!(1.2))),
            Direction::Short
        );
        assert_eq!(
            Direction::of(&signal("head_and_shoulders", dec!(1.0), dec!(1.2))),
            Direction::Short
        );
        assert_eq!(
            Direction::of(&signal("inverse_head_and_shoulders", dec!(1.0), dec!(0.9))),
            Direction::Long
        );
    }

    #[test]
    fn test_direction_falls_back_to_price_levels() {
        assert_eq!(
            Direction::of(&signal("flag", dec!(1.10), dec!(1.05))),
            Direction::Short
        );
        assert_eq!(
            Direction::of(&signal("flag", dec!(1.10), dec!(1.20))),
            Direction::Long
        );
    }

    #[test]
    fn test_direction_matches_whole_words() {
        // "stop" contains "top" but is not a top pattern
        assert_eq!(
            Direction::of(&signal("stop_hunt", dec!(1.10), dec!(1.20))),
            Direction::Long
        );
        assert_eq!(
            Direction::of(&signal("stop_hunt", dec!(1.10), dec!(1.05))),
            Direction::Short
        );
        assert_eq!(
            Direction::of(&signal("Bullish Engulfing", dec!(1.10), dec!(1.05))),
            Direction::Long
        );
        assert_eq!(
            Direction::of(&signal("rising_wedge", dec!(1.0), dec!(1.2))),
            Direction::Short
        );
        assert_eq!(
            Direction::of(&signal("falling-wedge", dec!(1.0), dec!(0.9))),
            Direction::Long
        );
        assert_eq!(
            Direction::of(&signal("triple_tops", dec!(1.0), dec!(1.2))),
            Direction::Short
        );
    }

    #[test]
    fn test_no_data_is_distinguished() {
        assert!(AnalysisError::no_data("EURUSD", "1h").is_no_data());
        assert!(!AnalysisError::Failed(anyhow::anyhow!("boom")).is_no_data());
        assert!(!AnalysisError::TimedOut(Duration::from_secs(1)).is_no_data());
    }
}
