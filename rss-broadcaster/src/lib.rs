pub mod types;
pub mod traits;
pub mod fetcher;
pub mod parser;
pub mod auth;
pub mod sources;
pub mod watermark;
pub mod aggregator;
pub mod lark;
pub mod scheduler;
pub mod config;
pub mod pipeline;
pub mod rss_utils;

pub use types::*;
pub use traits::{BroadcastSource, HttpTransport, TokenProvider, TransportResponse};
pub use fetcher::Fetcher;
pub use parser::FeedParser;
pub use sources::{RedditSource, RssFeedSource};
pub use watermark::{load_marks, save_marks, WatermarkStore};
pub use aggregator::{select_new_items, Broadcaster, Selection};
pub use lark::{sign, LarkWebhook};
pub use scheduler::{Scheduler, Trigger};
pub use config::Config;
pub use pipeline::{BroadcastPipeline, DeliveryMode, RunReport};
