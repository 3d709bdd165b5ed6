use crate::aggregator::Broadcaster;
use crate::auth::{RedditCredentials, RedditTokenProvider, TokenCache};
use crate::config::Config;
use crate::lark::LarkWebhook;
use crate::sources::{RedditSource, RssFeedSource};
use crate::traits::{BroadcastSource, HttpTransport, TokenProvider};
use crate::types::{Result, RunContext};
use crate::watermark::{save_marks, WatermarkStore};
use crate::Fetcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One post carrying every source's block.
    Merged,
    /// One post per source, titled after it.
    PerSource,
}

/// What a single run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub new_items: usize,
    pub messages: usize,
    pub delivered: usize,
}

/// Fetch → filter → merge → deliver, then persist watermarks.
pub struct BroadcastPipeline {
    broadcaster: Broadcaster,
    sink: LarkWebhook,
    mode: DeliveryMode,
    marks_path: Option<PathBuf>,
}

impl BroadcastPipeline {
    pub fn new(broadcaster: Broadcaster, sink: LarkWebhook, mode: DeliveryMode) -> Self {
        Self {
            broadcaster,
            sink,
            mode,
            marks_path: None,
        }
    }

    /// Save watermarks to `path` after every run.
    pub fn persist_to(mut self, path: PathBuf) -> Self {
        self.marks_path = Some(path);
        self
    }

    pub fn marks(&self) -> &Arc<WatermarkStore> {
        self.broadcaster.marks()
    }

    pub fn from_config(config: &Config, marks: Arc<WatermarkStore>) -> Result<Self> {
        let sources = build_sources(config)?;
        let broadcaster = Broadcaster::new(sources, marks, config.lark.header.clone());

        let transport: Arc<dyn HttpTransport> = Arc::new(reqwest::Client::builder().build()?);
        let sink = LarkWebhook::new(transport, config.lark.hook.clone(), config.lark.token.clone())
            .with_locale(config.lark.locale.clone());

        let mode = if config.lark.split_by_source {
            DeliveryMode::PerSource
        } else {
            DeliveryMode::Merged
        };

        Ok(Self::new(broadcaster, sink, mode))
    }

    pub async fn run_once(&self, ctx: &RunContext) -> RunReport {
        let mut report = RunReport::default();

        if let Some(message) = self.broadcaster.run(ctx).await {
            report.new_items = message.item_count();
            let messages = match self.mode {
                DeliveryMode::Merged => vec![message],
                DeliveryMode::PerSource => message.split_by_source(),
            };
            report.messages = messages.len();
            report.delivered = self.sink.deliver_all(ctx, &messages).await;
        }

        if let Some(path) = &self.marks_path {
            if let Err(e) = save_marks(path, self.marks()) {
                error!("Failed to save watermarks to {}: {}", path.display(), e);
            }
        }

        info!(
            "Run {} finished: {} new items, {}/{} messages delivered",
            ctx.run_id, report.new_items, report.delivered, report.messages
        );
        report
    }
}

/// Build every configured source. Feeds come first in file order, then the
/// reddit source.
pub fn build_sources(config: &Config) -> Result<Vec<Arc<dyn BroadcastSource>>> {
    let fetcher = Arc::new(Fetcher::new(config.fetch.clone())?);
    let mut sources: Vec<Arc<dyn BroadcastSource>> = Vec::with_capacity(config.feeds.len() + 1);

    for feed in &config.feeds {
        let source = RssFeedSource::new(feed.display_name(), feed.url.clone(), Arc::clone(&fetcher))
            .with_keywords(config.keywords_for(feed).to_vec(), config.match_description);
        info!("Adding RSS source {} ({})", source.name(), source.url());
        sources.push(Arc::new(source));
    }

    if let Some(reddit) = &config.reddit {
        let client = fetcher.client().clone();
        let tokens: Arc<dyn TokenProvider> = Arc::new(RedditTokenProvider::new(
            client.clone(),
            RedditCredentials {
                client_id: reddit.client_id.clone(),
                secret: reddit.secret.clone(),
                username: reddit.username.clone(),
                password: reddit.password.clone(),
            },
            TokenCache::new(),
        ));
        let source = RedditSource::new(reddit.subreddit.clone(), client, tokens)
            .with_name(reddit.display_name())
            .with_limit(reddit.limit);
        info!("Adding reddit source {}", source.name());
        sources.push(Arc::new(source));
    }

    Ok(sources)
}
