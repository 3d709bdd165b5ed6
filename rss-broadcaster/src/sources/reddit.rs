use crate::auth::REDDIT_USER_AGENT;
use crate::traits::{BroadcastSource, TokenProvider};
use crate::types::{BroadcastError, Item, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, info_span, Instrument, Span};

pub const REDDIT_OAUTH_ROOT: &str = "https://oauth.reddit.com";
const REDDIT_WEB_ROOT: &str = "https://www.reddit.com";

// Only the fields we broadcast.
#[derive(Debug, Deserialize)]
struct PostListResp {
    data: PostListData,
}

#[derive(Debug, Deserialize)]
struct PostListData {
    #[serde(default)]
    children: Vec<PostChild>,
}

#[derive(Debug, Deserialize)]
struct PostChild {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    title: String,
    permalink: String,
}

/// API-backed source: the hot listing of a subreddit.
///
/// Posts carry no publish time, so they are broadcast in listing order and
/// never filtered by watermark.
pub struct RedditSource {
    name: String,
    subreddit: String,
    limit: usize,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
    oauth_root: String,
    span: Span,
}

impl RedditSource {
    pub fn new(subreddit: String, client: Client, tokens: Arc<dyn TokenProvider>) -> Self {
        let name = format!("top /r/{} posts", subreddit);
        let span = info_span!("source", name = %name);
        Self {
            name,
            subreddit,
            limit: 10,
            client,
            tokens,
            oauth_root: REDDIT_OAUTH_ROOT.to_string(),
            span,
        }
    }

    pub fn with_name(mut self, name: String) -> Self {
        self.span = info_span!("source", name = %name);
        self.name = name;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_oauth_root(mut self, oauth_root: impl Into<String>) -> Self {
        self.oauth_root = oauth_root.into();
        self
    }

    async fn pull(&self) -> Result<Vec<Item>> {
        let token = self.tokens.token().await?;
        let url = format!("{}/r/{}/hot", self.oauth_root, self.subreddit);
        info!("Pulling hot posts: {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, REDDIT_USER_AGENT)
            .bearer_auth(token)
            .query(&[("raw_json", "1".to_string()), ("limit", self.limit.to_string())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(BroadcastError::General(format!("reddit HTTP {}: {}", status, body)));
        }

        let items = parse_hot_posts(&body)?;
        info!("Pulled {} posts from /r/{}", items.len(), self.subreddit);
        Ok(items)
    }
}

#[async_trait]
impl BroadcastSource for RedditSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_recent(&self) -> Result<Vec<Item>> {
        self.pull().instrument(self.span.clone()).await
    }
}

/// Parse a listing body into items with absolute permalinks.
pub fn parse_hot_posts(body: &str) -> Result<Vec<Item>> {
    let listing: PostListResp = serde_json::from_str(body)?;
    Ok(listing
        .data
        .children
        .into_iter()
        .map(|child| {
            let link = if child.data.permalink.starts_with("http") {
                child.data.permalink
            } else {
                format!("{}{}", REDDIT_WEB_ROOT, child.data.permalink)
            };
            Item::new(child.data.title, link)
        })
        .collect())
}
