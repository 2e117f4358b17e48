// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod sentiment;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::delivery::{DeliveryClient, Destination, HttpTransport};
use crate::ingest::providers::{HttpStreamSource, ReplaySource};
use crate::ingest::{ConnectionManager, EventSource, FlushScheduler, MicroBatchBuffer, Normalizer};
use crate::sentiment::LexiconScorer;

// ---- Re-exports for stable public API ----
pub use crate::config::FlushConfig;
pub use crate::ingest::{ConnectionState, NormalizedRecord};

/// Wire the production pipeline from a loaded configuration:
/// stream source -> normalizer -> buffer/scheduler -> delivery client.
pub fn build_pipeline(cfg: &AppConfig) -> Result<ConnectionManager> {
    let source: Arc<dyn EventSource> = match &cfg.stream.replay_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using replay source");
            let replay = ReplaySource::new(path);
            Arc::new(match cfg.stream.replay_pace {
                Some(pace) => replay.with_pace(pace),
                None => replay,
            })
        }
        None => Arc::new(HttpStreamSource::new(
            cfg.stream.url.clone(),
            cfg.stream.bearer_token.clone(),
        )?),
    };

    let transport = Arc::new(HttpTransport::new(cfg.delivery.timeout)?);
    let client = DeliveryClient::new(transport, cfg.delivery.retry);
    let dest = Destination {
        api_url: cfg.delivery.api_url.clone(),
        datasource: cfg.delivery.datasource.clone(),
        token: cfg.delivery.token.clone(),
    };

    let buffer = Arc::new(MicroBatchBuffer::new());
    let scheduler = FlushScheduler::new(cfg.flush, buffer, client, dest);
    let normalizer = Normalizer::new(Arc::new(LexiconScorer::new()), cfg.stream.tag.clone());

    Ok(ConnectionManager::new(
        source,
        cfg.stream.track.clone(),
        normalizer,
        scheduler,
        cfg.reconnect,
    ))
}
