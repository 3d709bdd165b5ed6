use crate::traits::BroadcastSource;
use crate::types::{Block, Item, OutboundMessage, RankedItem, RunContext};
use crate::watermark::WatermarkStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Items of one source that passed the watermark, plus the newest publish
/// time among them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub items: Vec<RankedItem>,
    pub latest: Option<DateTime<Utc>>,
}

/// Filter a newest-first batch against `initial`.
///
/// The batch is walked oldest-first, so the returned items are oldest-first.
/// An item's rank is its 1-based position counted from the oldest end of the
/// whole batch, i.e. `len - index_from_newest`. Items without a publish time
/// always pass and never move the watermark.
pub fn select_new_items(source: &str, items: &[Item], initial: Option<DateTime<Utc>>) -> Selection {
    let count = items.len();
    let mut selection = Selection::default();

    for (i, item) in items.iter().rev().enumerate() {
        if let (Some(published), Some(mark)) = (item.published_at, initial) {
            if published <= mark {
                debug!(
                    "Skipped item of {}: {} (published {}, watermark {})",
                    source, item.title, published, mark
                );
                continue;
            }
        }

        let index_from_newest = count - 1 - i;
        selection.items.push(RankedItem {
            rank: count - index_from_newest,
            title: item.title.clone(),
            link: item.link.clone(),
        });

        if let Some(published) = item.published_at {
            selection.latest = Some(selection.latest.map_or(published, |l| l.max(published)));
        }
    }

    selection
}

/// Fans a run out to every source, filters each against its watermark and
/// merges the survivors into at most one message.
pub struct Broadcaster {
    sources: Vec<Arc<dyn BroadcastSource>>,
    marks: Arc<WatermarkStore>,
    header: String,
    span: Span,
}

impl Broadcaster {
    pub fn new(sources: Vec<Arc<dyn BroadcastSource>>, marks: Arc<WatermarkStore>, header: impl Into<String>) -> Self {
        Self {
            sources,
            marks,
            header: header.into(),
            span: info_span!("broadcaster"),
        }
    }

    pub fn marks(&self) -> &Arc<WatermarkStore> {
        &self.marks
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Execute one run. Returns `None` when no source produced new items.
    pub async fn run(&self, ctx: &RunContext) -> Option<OutboundMessage> {
        self.fan_out(ctx).instrument(self.span.clone()).await
    }

    async fn fan_out(&self, ctx: &RunContext) -> Option<OutboundMessage> {
        info!("Run {}: polling {} sources", ctx.run_id, self.sources.len());

        // Dropping the set aborts whatever is still in flight.
        let mut tasks = JoinSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let marks = Arc::clone(&self.marks);
            let deadline = ctx.deadline;
            let span = info_span!("run", run_id = %ctx.run_id, source = %source.name());
            tasks.spawn(
                async move { (index, process_source(source.as_ref(), &marks, deadline).await) }.instrument(span),
            );
        }

        let mut collected: Vec<Option<Block>> = vec![None; self.sources.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, block)) => collected[index] = block,
                Err(e) => error!("Source task failed: {}", e),
            }
        }

        let blocks: Vec<Block> = collected.into_iter().flatten().collect();
        let message = OutboundMessage {
            header: self.header.clone(),
            blocks,
        };

        if message.is_empty() {
            info!("Run {}: nothing new", ctx.run_id);
            return None;
        }

        info!(
            "Run {}: {} new items from {} sources",
            ctx.run_id,
            message.item_count(),
            message.blocks.len()
        );
        Some(message)
    }
}

async fn process_source(source: &dyn BroadcastSource, marks: &WatermarkStore, deadline: Instant) -> Option<Block> {
    let name = source.name();

    let items = match timeout_at(deadline, source.fetch_recent()).await {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            error!("Failed to fetch {}: {}", name, e);
            return None;
        }
        Err(_) => {
            warn!("Fetch of {} cancelled: run deadline exceeded", name);
            return None;
        }
    };

    let initial = marks.get(name);
    let selection = select_new_items(name, &items, initial);

    if let Some(latest) = selection.latest {
        if marks.set(name, latest) {
            debug!("Watermark for {} advanced to {}", name, latest);
        }
    }

    debug!(
        "{}: {} fetched, {} new (watermark was {:?})",
        name,
        items.len(),
        selection.items.len(),
        initial
    );

    if selection.items.is_empty() {
        return None;
    }

    Some(Block {
        source: name.to_string(),
        items: selection.items,
    })
}
