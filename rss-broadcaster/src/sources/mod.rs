pub mod reddit;
pub mod rss_feed;

pub use reddit::RedditSource;
pub use rss_feed::RssFeedSource;
