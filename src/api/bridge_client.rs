//! HTTP client for a terminal bridge process.
//!
//! The bridge runs next to the trading terminal and exposes its API as JSON
//! over HTTP. Reads are retried with exponential backoff; order submission
//! is sent exactly once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::models::Position;

use super::terminal::TradingTerminal;
use super::types::{Credentials, OrderRequest, OrderResult, SymbolInfo, Tick};

pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:8228";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Acknowledgement body for bridge commands.
#[derive(Debug, Deserialize)]
struct Ack {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct SelectBody {
    enable: bool,
}

/// Client for the terminal bridge.
pub struct BridgeClient {
    client: Client,
    base_url: String,
}

impl BridgeClient {
    /// Create a client for the bridge at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url).with_context(|| format!("Invalid bridge URL {}", base_url))?;

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Create from `TERMINAL_BRIDGE_URL`, falling back to the local default.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("TERMINAL_BRIDGE_URL")
            .unwrap_or_else(|_| DEFAULT_BRIDGE_URL.to_string());
        Self::new(url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bridge URL with `segments` appended as percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid bridge URL {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Bridge URL cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn positions_url(&self, symbol: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(&["positions"])?;
        if let Some(symbol) = symbol {
            url.query_pairs_mut().append_pair("symbol", symbol);
        }
        Ok(url)
    }

    /// GET a JSON resource. 404 maps to `None`; 5xx and transport errors
    /// are retried.
    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<Option<T>> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(READ_RETRY_WINDOW),
            ..Default::default()
        };

        debug!(url = %url, "Bridge GET");

        retry(policy, || async move {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::transient(anyhow::anyhow!(
                    "Bridge request failed: {} - {}",
                    status,
                    body
                )));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(anyhow::anyhow!(
                    "Bridge request failed: {} - {}",
                    status,
                    body
                )));
            }

            let value = response
                .json::<T>()
                .await
                .context("Failed to parse bridge response")
                .map_err(backoff::Error::permanent)?;
            Ok(Some(value))
        })
        .await
    }

    /// POST a JSON body once and parse the reply.
    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &Url,
        body: &B,
    ) -> Result<T> {
        debug!(url = %url, "Bridge POST");

        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .context("Failed to reach terminal bridge")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Bridge request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse bridge response")
    }
}

#[async_trait]
impl TradingTerminal for BridgeClient {
    async fn initialize(&self, credentials: &Credentials) -> Result<bool> {
        let url = self.endpoint(&["initialize"])?;
        let ack: Ack = self.post_json(&url, credentials).await?;
        Ok(ack.ok)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>> {
        let url = self.endpoint(&["symbols", symbol])?;
        self.get_json(&url).await
    }

    async fn symbol_select(&self, symbol: &str, enable: bool) -> Result<bool> {
        let url = self.endpoint(&["symbols", symbol, "select"])?;
        let ack: Ack = self.post_json(&url, &SelectBody { enable }).await?;
        Ok(ack.ok)
    }

    async fn symbol_info_tick(&self, symbol: &str) -> Result<Option<Tick>> {
        let url = self.endpoint(&["symbols", symbol, "tick"])?;
        self.get_json(&url).await
    }

    async fn order_send(&self, request: &OrderRequest) -> Result<Option<OrderResult>> {
        let url = self.endpoint(&["orders"])?;
        self.post_json(&url, request).await
    }

    async fn positions_get(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let url = self.positions_url(symbol)?;
        Ok(self.get_json(&url).await?.unwrap_or_default())
    }

    async fn shutdown(&self) -> Result<()> {
        let url = self.endpoint(&["shutdown"])?;
        let _: Ack = self.post_json(&url, &serde_json::json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = BridgeClient::new("http://localhost:9000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:9000");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(BridgeClient::new("not a url").is_err());
    }

    #[test]
    fn test_symbols_are_percent_encoded() {
        let client = BridgeClient::new("http://localhost:9000/").unwrap();

        assert_eq!(
            client.endpoint(&["symbols", "US30#", "tick"]).unwrap().as_str(),
            "http://localhost:9000/symbols/US30%23/tick"
        );
        assert_eq!(
            client.endpoint(&["symbols", "EUR/USD"]).unwrap().as_str(),
            "http://localhost:9000/symbols/EUR%2FUSD"
        );
        assert_eq!(
            client.positions_url(Some("XAUUSD+")).unwrap().as_str(),
            "http://localhost:9000/positions?symbol=XAUUSD%2B"
        );
        assert_eq!(
            client.positions_url(None).unwrap().as_str(),
            "http://localhost:9000/positions"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = BridgeClient::new("http://bridge.local:8228/api/").unwrap();
        assert_eq!(
            client.endpoint(&["orders"]).unwrap().as_str(),
            "http://bridge.local:8228/api/orders"
        );
    }
}
