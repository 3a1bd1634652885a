//! HTTP adapter for a remote analysis service.
//!
//! Protocol:
//! - `POST {base}/analyze` with `{"symbol": .., "timeframe": ..}`
//! - `200` with `{"signals": [..]}` on success
//! - `404` when the service has no data for the symbol

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{AnalysisEngine, AnalysisError, TradeSignal};

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    symbol: &'a str,
    timeframe: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    signals: Vec<TradeSignal>,
}

/// Analysis engine reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAnalysisEngine {
    client: Client,
    base_url: String,
}

impl HttpAnalysisEngine {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    #[instrument(skip(self), name = "http_analyze")]
    async fn analyze(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<TradeSignal>, AnalysisError> {
        let url = format!("{}/analyze", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&AnalyzeRequest { symbol, timeframe })
            .send()
            .await
            .context("Failed to send analyze request")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AnalysisError::no_data(symbol, timeframe));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Analysis service error {}: {}", status, body).into());
        }

        let data: AnalyzeResponse = response
            .json()
            .await
            .context("Failed to parse analyze response")?;

        debug!(symbol, timeframe, signals = data.signals.len(), "Analysis complete");
        Ok(data.signals)
    }
}
