//! Delivery client: uploads CSV payloads to the ingestion endpoint with
//! bounded retry and exponential backoff.
//!
//! Transient failures (transport errors, 5xx, 429) are retried until the
//! attempt budget is spent. A 4xx answer is terminal for that payload.
//! A retry after an unacknowledged success may duplicate rows; the endpoint
//! is append-only, so delivery is at-least-once.

pub mod http;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};

use crate::config::RetryPolicy;
use crate::error::DeliveryError;

pub use http::HttpTransport;

/// Where a payload goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub api_url: String,
    pub datasource: String,
    pub token: String,
}

impl Destination {
    /// Append-mode datasource URL (query string excluded).
    pub fn datasources_url(&self) -> String {
        format!("{}/datasources", self.api_url.trim_end_matches('/'))
    }
}

/// One upload attempt. Implementations return `Ok(())` on a 2xx answer.
#[async_trait::async_trait]
pub trait IngestTransport: Send + Sync {
    async fn post_csv(&self, dest: &Destination, payload: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Terminal 4xx; not retried.
    Rejected { status: u16, attempts: u32 },
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last_error: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts }
            | DeliveryOutcome::Rejected { attempts, .. }
            | DeliveryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct DeliveryClient {
    transport: Arc<dyn IngestTransport>,
    policy: RetryPolicy,
}

impl DeliveryClient {
    pub fn new(transport: Arc<dyn IngestTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// `true` when the endpoint acknowledged the payload.
    pub async fn send(&self, payload: &str, dest: &Destination) -> bool {
        self.deliver(payload, dest).await.is_success()
    }

    pub async fn deliver(&self, payload: &str, dest: &Destination) -> DeliveryOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            counter!("delivery_attempts_total").increment(1);

            match self.transport.post_csv(dest, payload).await {
                Ok(()) => break DeliveryOutcome::Delivered { attempts: attempt },
                Err(e) if !e.is_transient() => {
                    let status = e.status().unwrap_or_default();
                    tracing::warn!(
                        status,
                        attempt,
                        error = %truncate(&e.to_string(), 300),
                        datasource = %dest.datasource,
                        "ingestion endpoint rejected payload"
                    );
                    break DeliveryOutcome::Rejected {
                        status,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        break DeliveryOutcome::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        };
                    }
                    let delay = self.policy.delay_after(attempt);
                    tracing::debug!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "delivery attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        histogram!("delivery_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        outcome
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
