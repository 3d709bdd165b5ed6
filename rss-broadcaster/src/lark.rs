//! Lark (Feishu) custom-bot webhook delivery.
//!
//! Messages are rendered as `post` rich text, signed with the bot secret and
//! sent one at a time with a minimum spacing between requests.

use crate::traits::HttpTransport;
use crate::types::{BroadcastError, OutboundMessage, Result, RunContext};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, info_span, Instrument, Span};

pub const DEFAULT_LOCALE: &str = "zh_cn";
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_secs(1);

/// Lark's signature: the timestamp and secret form the HMAC *key* and the
/// signed payload is empty.
pub fn sign(timestamp: i64, secret: &str) -> Result<String> {
    let key = format!("{}\n{}", timestamp, secret);
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).map_err(|e| BroadcastError::Signing(e.to_string()))?;
    mac.update(&[]);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Inline element of a rich-text line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tag")]
pub enum Segment {
    #[serde(rename = "text")]
    Text { un_escape: bool, lines: u32, text: String },
    #[serde(rename = "a")]
    Link { text: String, href: String },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text {
            un_escape: true,
            lines: 1,
            text: text.into(),
        }
    }

    pub fn link(text: impl Into<String>, href: impl Into<String>) -> Self {
        Segment::Link {
            text: text.into(),
            href: href.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LarkPost {
    pub title: String,
    pub content: Vec<Vec<Segment>>,
}

#[derive(Debug, Serialize)]
pub struct PostContent {
    pub post: BTreeMap<String, LarkPost>,
}

#[derive(Debug, Serialize)]
pub struct LarkBotMsgReq {
    pub msg_type: String,
    pub content: PostContent,
    pub timestamp: String,
    pub sign: String,
}

/// Render a message as post rich text. Each block gets a heading line with
/// its source name unless the whole post is already titled after it.
pub fn render_post(message: &OutboundMessage) -> LarkPost {
    let mut content = Vec::with_capacity(message.item_count() + message.blocks.len());

    for block in &message.blocks {
        if block.source != message.header {
            content.push(vec![Segment::text(block.source.clone())]);
        }
        for item in &block.items {
            content.push(vec![
                Segment::text(format!("{:2}: ", item.rank)),
                Segment::link(item.title.clone(), item.link.clone()),
            ]);
        }
    }

    LarkPost {
        title: message.header.clone(),
        content,
    }
}

pub fn build_request(message: &OutboundMessage, locale: &str, timestamp: i64, secret: &str) -> Result<LarkBotMsgReq> {
    let sign = sign(timestamp, secret)?;
    let mut post = BTreeMap::new();
    post.insert(locale.to_string(), render_post(message));

    Ok(LarkBotMsgReq {
        msg_type: "post".to_string(),
        content: PostContent { post },
        timestamp: timestamp.to_string(),
        sign,
    })
}

pub struct LarkWebhook {
    transport: Arc<dyn HttpTransport>,
    hook: String,
    secret: String,
    locale: String,
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
    span: Span,
}

impl LarkWebhook {
    pub fn new(transport: Arc<dyn HttpTransport>, hook: String, secret: String) -> Self {
        Self {
            transport,
            hook,
            secret,
            locale: DEFAULT_LOCALE.to_string(),
            min_spacing: DEFAULT_MIN_SPACING,
            next_slot: Mutex::new(None),
            span: info_span!("lark_webhook"),
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_min_spacing(mut self, min_spacing: Duration) -> Self {
        self.min_spacing = min_spacing;
        self
    }

    /// Sign and POST one message. Transport errors, non-2xx statuses and
    /// unreadable bodies come back as errors; nothing is retried.
    pub async fn deliver(&self, ctx: &RunContext, message: &OutboundMessage) -> Result<()> {
        self.send(ctx, message).instrument(self.span.clone()).await
    }

    /// Deliver messages in order. A failed message is logged and the rest are
    /// still attempted. Returns how many were accepted.
    pub async fn deliver_all(&self, ctx: &RunContext, messages: &[OutboundMessage]) -> usize {
        let mut delivered = 0;
        for message in messages {
            match self.deliver(ctx, message).await {
                Ok(()) => delivered += 1,
                Err(e) => error!("Failed to deliver '{}' to lark: {}", message.header, e),
            }
        }
        delivered
    }

    async fn send(&self, ctx: &RunContext, message: &OutboundMessage) -> Result<()> {
        self.pace().await;

        if ctx.is_expired() {
            return Err(BroadcastError::Timeout("delivering to lark".to_string()));
        }

        let request = build_request(message, &self.locale, Utc::now().timestamp(), &self.secret)?;
        let body = serde_json::to_vec(&request)?;

        let response = self.transport.post_json(&self.hook, body, ctx.remaining()).await?;
        if !(200..300).contains(&response.status) {
            return Err(BroadcastError::Delivery {
                status: response.status,
                body: response.body,
            });
        }

        info!("Lark accepted '{}' ({} items): {}", message.header, message.item_count(), response.body);
        Ok(())
    }

    /// Reserve the next send slot and wait for it. The lock only covers the
    /// reservation.
    async fn pace(&self) {
        let wait = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(slot + self.min_spacing);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
