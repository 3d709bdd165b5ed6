use crate::traits::BroadcastSource;
use crate::types::{FetchResult, Item, Result};
use crate::{FeedParser, Fetcher};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, info_span, Instrument, Span};

#[derive(Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Feed-backed source: an RSS/Atom URL filtered by keywords.
pub struct RssFeedSource {
    name: String,
    url: String,
    keywords: Vec<String>,
    match_description: bool,
    fetcher: Arc<Fetcher>,
    parser: FeedParser,
    validators: Mutex<Validators>,
    span: Span,
}

impl RssFeedSource {
    pub fn new(name: String, url: String, fetcher: Arc<Fetcher>) -> Self {
        let span = info_span!("source", name = %name);
        Self {
            name,
            url,
            keywords: Vec::new(),
            match_description: true,
            fetcher,
            parser: FeedParser::new(),
            validators: Mutex::new(Validators::default()),
            span,
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>, match_description: bool) -> Self {
        self.keywords = keywords;
        self.match_description = match_description;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Keep only keyword matches and order newest first.
    pub fn select_items(&self, items: Vec<Item>) -> Vec<Item> {
        let mut selected: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                let keep = matches_keywords(item, &self.keywords, self.match_description);
                if keep {
                    debug!("Item added: {}", item.title);
                }
                keep
            })
            .collect();
        // Stable, so feeds with equal timestamps keep document order.
        selected.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        selected
    }

    async fn pull(&self) -> Result<Vec<Item>> {
        info!("Pulling RSS feed: {}", self.url);

        let (etag, last_modified) = {
            let v = self.validators.lock().unwrap_or_else(PoisonError::into_inner);
            (v.etag.clone(), v.last_modified.clone())
        };

        let (body, etag, last_modified) = match self
            .fetcher
            .fetch_feed(&self.url, etag.as_deref(), last_modified.as_deref())
            .await?
        {
            FetchResult::NotModified => {
                info!("Feed {} not modified since last pull", self.url);
                return Ok(Vec::new());
            }
            FetchResult::Content {
                body,
                etag,
                last_modified,
            } => (body, etag, last_modified),
        };

        let parsed_feed = self.parser.parse_feed(&body)?;

        // Only a body that parsed may be skipped next time.
        {
            let mut v = self.validators.lock().unwrap_or_else(PoisonError::into_inner);
            v.etag = etag;
            v.last_modified = last_modified;
        }

        let feed_title = parsed_feed.title.clone().unwrap_or_else(|| self.url.clone());
        let items = self.select_items(self.parser.into_items(parsed_feed));

        info!("Pulled {} matching items from RSS feed {}", items.len(), feed_title);
        Ok(items)
    }
}

#[async_trait]
impl BroadcastSource for RssFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_recent(&self) -> Result<Vec<Item>> {
        self.pull().instrument(self.span.clone()).await
    }
}

/// An empty keyword list accepts everything; otherwise any keyword contained
/// in the title (or the description, when enabled) is a match.
pub fn matches_keywords(item: &Item, keywords: &[String], match_description: bool) -> bool {
    if keywords.is_empty() {
        return true;
    }
    keywords.iter().any(|keyword| {
        item.title.contains(keyword.as_str())
            || (match_description
                && item
                    .description
                    .as_deref()
                    .is_some_and(|d| d.contains(keyword.as_str())))
    })
}
