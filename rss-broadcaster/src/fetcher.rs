use crate::types::{BroadcastError, FetchConfig, FetchResult, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Minimum spacing between two requests to the same host.
const HOST_MIN_INTERVAL: Duration = Duration::from_secs(1);

const BYTES_PER_MB: usize = 1024 * 1024;

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Mutex<HashMap<String, Instant>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// GET `url` with conditional headers, retrying transport errors and
    /// non-success statuses with exponential backoff.
    pub async fn fetch_feed(&self, url: &str, etag: Option<&str>, last_modified: Option<&str>) -> Result<FetchResult> {
        debug!("Fetching feed: {}", url);

        self.apply_rate_limit(url).await?;

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.fetch_with_conditional_headers(url, etag, last_modified).await {
                Ok(response) => {
                    let status = response.status();

                    if status == StatusCode::NOT_MODIFIED {
                        debug!("Feed not modified: {}", url);
                        return Ok(FetchResult::NotModified);
                    }

                    if status.is_success() {
                        return self.read_body(url, response).await;
                    }

                    last_error = Some(BroadcastError::General(format!(
                        "HTTP {}: {}",
                        status,
                        status.canonical_reason().unwrap_or("Unknown")
                    )));
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            break;
        }

        warn!("Failed to fetch feed after {} attempts: {}", self.config.max_retries + 1, url);
        Err(last_error.unwrap_or_else(|| BroadcastError::General(format!("Failed to fetch {}", url))))
    }

    /// Stream the body, failing as soon as it passes the size cap. The
    /// declared length is checked up front but not trusted.
    async fn read_body(&self, url: &str, mut response: Response) -> Result<FetchResult> {
        let etag = header_value(&response, "etag");
        let last_modified = header_value(&response, "last-modified");
        let limit = self.config.max_feed_size_mb.saturating_mul(BYTES_PER_MB);

        if let Some(content_length) = response.content_length() {
            if content_length > limit as u64 {
                return Err(BroadcastError::FeedTooLarge {
                    size_mb: size_in_mb(content_length as usize),
                });
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() > limit {
                warn!("Feed {} passed the {}MB cap, aborting download", url, self.config.max_feed_size_mb);
                return Err(BroadcastError::FeedTooLarge {
                    size_mb: size_in_mb(bytes.len()),
                });
            }
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        info!("Fetched feed: {} ({} bytes)", url, body.len());
        Ok(FetchResult::Content {
            body,
            etag,
            last_modified,
        })
    }

    async fn fetch_with_conditional_headers(&self, url: &str, etag: Option<&str>, last_modified: Option<&str>) -> Result<Response> {
        let mut request = self.client.get(url);

        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        if let Some(last_modified) = last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }

        let response = request.send().await?;
        Ok(response)
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();

        // Reserve our slot under the lock, sleep outside it.
        let wait = {
            let mut limiter = self.rate_limiter.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match limiter.get(&host) {
                Some(last) if *last + HOST_MIN_INTERVAL > now => *last + HOST_MIN_INTERVAL,
                _ => now,
            };
            limiter.insert(host.clone(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait);
            tokio::time::sleep(wait).await;
        }

        Ok(())
    }
}

/// Size rounded up to whole megabytes.
fn size_in_mb(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_PER_MB)
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
