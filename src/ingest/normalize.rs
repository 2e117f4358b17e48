//! Event normalizer: raw stream event -> cleaned, scored record.
//!
//! Deterministic for a given event and scorer. Scoring failures never abort
//! the record; they are logged, counted and replaced by a neutral polarity.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{InboundEvent, NormalizedRecord};
use crate::sentiment::{round4, PolarityScorer};

/// Polarity assigned when the scorer fails.
pub const NEUTRAL_POLARITY: f64 = 0.0;

/// Canonical timestamp layout of the `date` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// URL-shaped tokens first so "http://x.co/a!!" goes as one unit; then any
// character that is not an ASCII letter, an ASCII digit or whitespace.
static RE_STRIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+://\S+|[^0-9A-Za-z\s]").expect("static regex"));

/// Decode entities, drop URLs and punctuation, collapse whitespace, trim.
pub fn clean_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_STRIP.replace_all(&decoded, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse the publish date in any of the layouts the stream uses and render
/// it as `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn normalize_timestamp(raw: &str) -> Result<String> {
    let raw = raw.trim();

    // Legacy stream layout: "Wed Oct 10 20:19:24 +0000 2018"
    if let Ok(dt) = DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y") {
        return Ok(dt.with_timezone(&Utc).format(TIMESTAMP_FORMAT).to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).format(TIMESTAMP_FORMAT).to_string());
    }
    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc2822) {
        let utc = DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), 0)
            .ok_or_else(|| anyhow!("timestamp out of range: {raw:?}"))?;
        return Ok(utc.format(TIMESTAMP_FORMAT).to_string());
    }
    // Already canonical.
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Ok(naive.format(TIMESTAMP_FORMAT).to_string());
    }
    Err(anyhow!("unrecognised timestamp {raw:?}"))
}

#[derive(Clone)]
pub struct Normalizer {
    scorer: Arc<dyn PolarityScorer>,
    default_tag: String,
}

impl Normalizer {
    pub fn new(scorer: Arc<dyn PolarityScorer>, default_tag: impl Into<String>) -> Self {
        Self {
            scorer,
            default_tag: default_tag.into(),
        }
    }

    /// Fails only when the publish date cannot be parsed; the event is then
    /// treated as malformed and skipped by the caller.
    pub fn normalize(&self, ev: &InboundEvent) -> Result<NormalizedRecord> {
        let timestamp = normalize_timestamp(&ev.created_at)?;
        let text = clean_text(&ev.text);
        let polarity = self.score(ev.id, &text);
        let tag = ev
            .tag
            .clone()
            .unwrap_or_else(|| self.default_tag.clone());

        Ok(NormalizedRecord {
            id: ev.id,
            timestamp,
            text,
            tag,
            polarity,
        })
    }

    fn score(&self, id: u64, text: &str) -> f64 {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.scorer.polarity(text)));
        let err = match outcome {
            Ok(Ok(p)) if p.is_finite() => return round4(p.clamp(-1.0, 1.0)),
            Ok(Ok(p)) => anyhow!("non-finite polarity {p}"),
            Ok(Err(e)) => e,
            Err(_) => anyhow!("scorer panicked"),
        };
        tracing::warn!(id, error = %err, "scoring failed; using neutral polarity");
        counter!("scoring_failures_total").increment(1);
        NEUTRAL_POLARITY
    }
}
