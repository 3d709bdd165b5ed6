use crate::lark::DEFAULT_LOCALE;
use crate::rss_utils;
use crate::scheduler::Trigger;
use crate::types::{BroadcastError, FetchConfig, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cron: CronConfig,
    pub lark: LarkConfig,
    /// Keywords applied to feeds that do not declare their own.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub match_description: bool,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub reddit: Option<RedditConfig>,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronConfig {
    #[serde(alias = "internal")]
    pub interval: String,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LarkConfig {
    pub hook: String,
    #[serde(alias = "secret")]
    pub token: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_header")]
    pub header: String,
    /// Send one post per source instead of a single merged post.
    #[serde(default)]
    pub split_by_source: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
}

impl FeedConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| match rss_utils::url::extract_domain(&self.url) {
            Some(domain) => format!("RSS Feed ({})", domain),
            None => "RSS Feed".to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditConfig {
    pub subreddit: String,
    #[serde(alias = "clientId")]
    pub client_id: String,
    pub secret: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_reddit_limit")]
    pub limit: usize,
}

impl RedditConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("top /r/{} posts", self.subreddit))
    }
}

fn default_true() -> bool {
    true
}

fn default_run_timeout_secs() -> u64 {
    120
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}

fn default_header() -> String {
    "New in your feeds".to_string()
}

fn default_reddit_limit() -> usize {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded config from {}: {} feeds, reddit {}",
            path.display(),
            config.feeds.len(),
            if config.reddit.is_some() { "on" } else { "off" }
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.cron.run_timeout_secs)
    }

    pub fn trigger(&self) -> Result<Trigger> {
        Trigger::parse(&self.cron.interval)
    }

    /// Keywords that apply to `feed`.
    pub fn keywords_for<'a>(&'a self, feed: &'a FeedConfig) -> &'a [String] {
        feed.keywords.as_deref().unwrap_or(&self.keywords)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lark.hook.trim().is_empty() {
            return Err(BroadcastError::Config("lark.hook must not be empty".to_string()));
        }
        if self.cron.run_timeout_secs == 0 {
            return Err(BroadcastError::Config("cron.run_timeout_secs must be positive".to_string()));
        }
        self.trigger()?;

        let mut names = HashSet::new();
        for feed in &self.feeds {
            if !rss_utils::url::is_valid_rss_url(&feed.url) {
                return Err(BroadcastError::Config(format!("feed url '{}' is not http(s)", feed.url)));
            }
            let name = feed.display_name();
            if !names.insert(name.clone()) {
                return Err(BroadcastError::Config(format!("duplicate source name '{}'", name)));
            }
        }
        if let Some(reddit) = &self.reddit {
            let name = reddit.display_name();
            if !names.insert(name.clone()) {
                return Err(BroadcastError::Config(format!("duplicate source name '{}'", name)));
            }
        }

        if names.is_empty() {
            warn!("No sources configured; every run will be empty");
        }
        Ok(())
    }
}
