// src/ingest/mod.rs
pub mod buffer;
pub mod connection;
pub mod normalize;
pub mod payload;
pub mod providers;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub use buffer::{Batch, MicroBatchBuffer};
pub use connection::{ConnectionManager, ConnectionState};
pub use normalize::{clean_text, Normalizer};
pub use scheduler::{FlushScheduler, FlushTrigger};
pub use types::{EventSource, InboundEvent, NormalizedRecord, Subscription};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("stream_events_total", "Non-empty lines received from the stream.");
        describe_counter!(
            "stream_events_skipped_total",
            "Events skipped as malformed (missing fields, bad timestamp)."
        );
        describe_counter!(
            "stream_connect_attempts_total",
            "Subscription attempts, successful or not."
        );
        describe_counter!(
            "stream_reconnects_total",
            "Transitions back to Disconnected."
        );
        describe_counter!(
            "stream_backpressure_waits_total",
            "Times intake paused for an in-flight flush."
        );
        describe_gauge!(
            "stream_connection_state",
            "0 = disconnected, 1 = connecting, 2 = streaming."
        );
        describe_counter!(
            "scoring_failures_total",
            "Records that fell back to neutral polarity."
        );
        describe_counter!("flush_total", "Flushes started, by trigger.");
        describe_counter!("flush_records_total", "Records acknowledged by the endpoint.");
        describe_counter!("flush_dropped_total", "Batches dropped after delivery failed.");
        describe_counter!(
            "flush_dropped_records_total",
            "Records lost with dropped batches."
        );
        describe_counter!("delivery_attempts_total", "Upload attempts, retries included.");
        describe_histogram!(
            "delivery_duration_ms",
            "Wall time of one delivery including retries, in milliseconds."
        );
        describe_gauge!("buffer_records", "Records currently buffered.");
        describe_gauge!("buffer_bytes", "Serialized bytes currently buffered.");
    });
}
