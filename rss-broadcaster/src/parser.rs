use crate::types::{BroadcastError, Item, ParsedEntry, ParsedFeed, Result};
use chrono::Utc;
use feed_rs::parser;
use tracing::debug;

/// Turns RSS/Atom documents into entries and broadcastable items.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_feed(&self, content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| BroadcastError::Parse(format!("Failed to parse feed: {}", e)))?;

        let title = feed.title.map(|t| t.content);
        let entries: Vec<ParsedEntry> = feed.entries.into_iter().filter_map(Self::parse_entry).collect();

        debug!("Parsed feed with {} entries", entries.len());
        Ok(ParsedFeed { title, entries })
    }

    fn parse_entry(entry: feed_rs::model::Entry) -> Option<ParsedEntry> {
        let title = entry.title.map(|t| t.content).unwrap_or_else(|| "Untitled".to_string());

        // Atom entries may also carry self/replies/enclosure links.
        let link = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
            .or_else(|| entry.links.first());
        let url = match link {
            Some(link) => link.href.clone(),
            None => {
                debug!("Skipping entry without link: {}", title);
                return None;
            }
        };

        Some(ParsedEntry {
            url,
            title,
            description: entry.summary.map(|s| s.content),
            published_at: entry.published.map(|dt| dt.with_timezone(&Utc)),
            updated_at: entry.updated.map(|dt| dt.with_timezone(&Utc)),
        })
    }

    /// Convert entries into items. The publish time falls back to the update
    /// time; entries with neither cannot be watermarked and are dropped.
    pub fn into_items(&self, parsed_feed: ParsedFeed) -> Vec<Item> {
        parsed_feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let Some(at) = entry.published_at.or(entry.updated_at) else {
                    debug!("Dropping undated entry: {} ({})", entry.title, entry.url);
                    return None;
                };
                Some(Item {
                    title: entry.title,
                    link: entry.url,
                    description: entry.description,
                    published_at: Some(at),
                })
            })
            .collect()
    }
}
