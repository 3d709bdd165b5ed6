use crate::traits::TokenProvider;
use crate::types::{BroadcastError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const REDDIT_API_ROOT: &str = "https://www.reddit.com/api";
const ACCESS_TOKEN_PATH: &str = "/v1/access_token";
pub const REDDIT_USER_AGENT: &str = "rust:rss-broadcaster:v0.1.0";

/// Seconds shaved off the server-declared lifetime before caching.
const EXPIRY_MARGIN_SECS: i64 = 1000;

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Expiring token cache keyed by client identity. Cheap to clone; clones
/// share entries.
#[derive(Clone, Default)]
pub struct TokenCache {
    entries: Arc<Mutex<HashMap<String, CachedToken>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.token.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, token: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            CachedToken {
                token,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// How long a token may be cached given the server's `expires_in`, or `None`
/// when the remaining lifetime is too short to cache at all.
pub fn cache_ttl(expires_in: i64) -> Option<Duration> {
    let secs = expires_in - EXPIRY_MARGIN_SECS;
    if secs <= 0 {
        None
    } else {
        Some(Duration::from_secs(secs as u64))
    }
}

#[derive(Debug, Deserialize)]
pub struct AccessTokenResp {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub secret: String,
    pub username: String,
    pub password: String,
}

/// Password-grant OAuth for the reddit API.
pub struct RedditTokenProvider {
    client: Client,
    credentials: RedditCredentials,
    api_root: String,
    cache: TokenCache,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl RedditTokenProvider {
    pub fn new(client: Client, credentials: RedditCredentials, cache: TokenCache) -> Self {
        Self {
            client,
            credentials,
            api_root: REDDIT_API_ROOT.to_string(),
            cache,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into();
        self
    }

    pub fn cache_key(&self) -> String {
        format!("reddit_{}_access_token", self.credentials.client_id)
    }

    async fn request_token(&self) -> Result<AccessTokenResp> {
        let url = format!("{}{}", self.api_root, ACCESS_TOKEN_PATH);
        let form = [
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::USER_AGENT, REDDIT_USER_AGENT)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(BroadcastError::Token(format!("HTTP {}: {}", status, body)));
        }

        let token: AccessTokenResp = serde_json::from_str(&body)?;
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for RedditTokenProvider {
    async fn token(&self) -> Result<String> {
        let key = self.cache_key();
        if let Some(token) = self.cache.get(&key) {
            return Ok(token);
        }

        // One refresh at a time; whoever waited re-checks the cache first.
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.cache.get(&key) {
            return Ok(token);
        }

        let resp = self.request_token().await?;
        match cache_ttl(resp.expires_in) {
            Some(ttl) => {
                info!("Cached reddit access token for {:?}", ttl);
                self.cache.insert(&key, resp.access_token.clone(), ttl);
            }
            None => debug!("Reddit token expires in {}s, not caching", resp.expires_in),
        }
        Ok(resp.access_token)
    }
}
