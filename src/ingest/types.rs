// src/ingest/types.rs
use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::error::StreamError;

/// One event as delivered by the stream, before cleaning and scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub id: u64,
    pub created_at: String, // as published, any supported layout
    pub text: String,       // raw, entity-encoded
    pub tag: Option<String>, // matching rule tag, if the stream reports one
}

/// Cleaned, scored row ready for buffering.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NormalizedRecord {
    pub id: u64,
    pub timestamp: String, // "YYYY-MM-DD HH:MM:SS", UTC
    pub text: String,
    pub tag: String,
    pub polarity: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Envelope {
        data: WireTweet,
        #[serde(default)]
        matching_rules: Vec<WireRule>,
    },
    Flat(WireTweet),
}

#[derive(Deserialize)]
struct WireTweet {
    id: WireId,
    created_at: String,
    text: String,
    #[serde(default)]
    extended_tweet: Option<WireExtended>,
}

#[derive(Deserialize)]
struct WireExtended {
    full_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Num(u64),
    Str(String),
}

#[derive(Deserialize)]
struct WireRule {
    #[serde(default)]
    tag: Option<String>,
}

impl InboundEvent {
    /// Parse one raw stream line. Control messages and payloads missing
    /// `id`, `created_at` or `text` are errors; callers skip them.
    pub fn parse(raw: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(raw)
            .map_err(|e| anyhow!("not an event payload: {e}"))?;

        let (tweet, tag) = match wire {
            WireEvent::Envelope {
                data,
                matching_rules,
            } => {
                let tag = matching_rules
                    .into_iter()
                    .find_map(|r| r.tag.filter(|t| !t.is_empty()));
                (data, tag)
            }
            WireEvent::Flat(t) => (t, None),
        };

        let id = match tweet.id {
            WireId::Num(n) => n,
            WireId::Str(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| anyhow!("non-numeric id {s:?}"))?,
        };
        let text = match tweet.extended_tweet {
            Some(ext) => ext.full_text,
            None => tweet.text,
        };

        Ok(Self {
            id,
            created_at: tweet.created_at,
            text,
            tag,
        })
    }
}

/// Subscription-based inbound feed. Reconnecting is the caller's job.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, track: &[String]) -> Result<Box<dyn Subscription>, StreamError>;
    fn name(&self) -> &'static str;
}

/// An established subscription.
#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Next raw payload line. `Ok(None)` means the upstream closed the subscription.
    async fn next_line(&mut self) -> Result<Option<String>, StreamError>;
}
