use crate::types::{Item, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A named provider of broadcastable items (RSS feeds, APIs, etc.)
#[async_trait]
pub trait BroadcastSource: Send + Sync {
    /// Unique name for this source, also used as its watermark key
    fn name(&self) -> &str;

    /// Fetch the current window of items, newest first.
    async fn fetch_recent(&self) -> Result<Vec<Item>>;
}

/// Supplies bearer credentials for API-backed sources.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Raw response from an HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends a JSON body to a URL. The webhook sink only talks to the network
/// through this seam.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<TransportResponse>;
}

#[async_trait]
impl HttpTransport for reqwest::Client {
    async fn post_json(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<TransportResponse> {
        let response = self
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}
