//! # Stream Connection Manager
//! Keeps one inbound subscription alive and routes every event through
//! normalizer -> buffer -> flush triggers.
//!
//! State machine:
//! `Disconnected --connect--> Connecting --established--> Streaming --(error | closed)--> Disconnected`
//!
//! Reconnects are unbounded, with capped exponential backoff plus jitter so
//! an upstream outage is not hammered. While a flush is in flight no event is
//! processed; intake awaits the buffer's idle notification instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::watch;

use crate::config::ReconnectPolicy;
use crate::error::StreamError;
use crate::ingest::normalize::Normalizer;
use crate::ingest::scheduler::{FlushScheduler, FlushStats};
use crate::ingest::types::{EventSource, InboundEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
}

impl ConnectionState {
    fn as_gauge(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Streaming => 2.0,
        }
    }
}

/// Delay before reconnect number `failures` (1-based): exponential from
/// `initial_delay`, capped at `max_delay`, jittered into [d/2, d].
pub fn backoff_delay(policy: &ReconnectPolicy, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let capped = policy
        .initial_delay
        .saturating_mul(1u32 << exp)
        .min(policy.max_delay);
    let half = capped / 2;
    let spread = (capped - half).as_millis() as u64;
    let jitter = if spread > 0 {
        rand::rng().random_range(0..=spread)
    } else {
        0
    };
    (half + Duration::from_millis(jitter)).min(policy.max_delay)
}

pub struct ConnectionManager {
    source: Arc<dyn EventSource>,
    track: Vec<String>,
    normalizer: Normalizer,
    scheduler: FlushScheduler,
    reconnect: ReconnectPolicy,
    backpressure_log_after: Duration,
    state: watch::Sender<ConnectionState>,
    connect_attempts: u64,
}

impl ConnectionManager {
    pub fn new(
        source: Arc<dyn EventSource>,
        track: Vec<String>,
        normalizer: Normalizer,
        scheduler: FlushScheduler,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            track,
            normalizer,
            scheduler,
            reconnect,
            backpressure_log_after: Duration::from_secs(10),
            state,
            connect_attempts: 0,
        }
    }

    /// How long intake waits on an in-flight flush before logging (and
    /// waiting again).
    pub fn with_backpressure_log_after(mut self, d: Duration) -> Self {
        self.backpressure_log_after = d;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.send_replace(s);
        gauge!("stream_connection_state").set(s.as_gauge());
    }

    /// Runs until the process ends. There is no terminal failure.
    pub async fn run(&mut self) {
        let mut failures: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            self.connect_attempts += 1;
            counter!("stream_connect_attempts_total").increment(1);
            tracing::info!(
                attempt = self.connect_attempts,
                source = self.source.name(),
                track = ?self.track,
                "connecting to stream"
            );

            let source = Arc::clone(&self.source);
            let track = self.track.clone();
            let connected = self.scheduler.run_until(source.connect(&track)).await;
            match connected {
                Ok(sub) => {
                    self.set_state(ConnectionState::Streaming);
                    tracing::info!(source = source.name(), "stream established");
                    let (processed, end) = self.consume(sub).await;
                    if processed > 0 {
                        failures = 0;
                    }
                    match end {
                        Ok(()) => tracing::warn!(processed, "stream closed by upstream"),
                        Err(e) => tracing::warn!(processed, error = %e, "stream failed"),
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt = self.connect_attempts, error = %e, "stream connect failed");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            failures = failures.saturating_add(1);
            counter!("stream_reconnects_total").increment(1);
            let delay = backoff_delay(&self.reconnect, failures);
            tracing::warn!(
                failures,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after delay"
            );
            self.scheduler.run_until(tokio::time::sleep(delay)).await;
        }
    }

    /// Run until `shutdown` resolves, then drain the buffer best-effort.
    pub async fn run_until_shutdown<S: Future>(mut self, shutdown: S) -> FlushStats {
        tokio::select! {
            _ = self.run() => {}
            _ = shutdown => {
                tracing::info!("shutdown requested; flushing remaining records");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.scheduler.shutdown().await
    }

    /// Read until the subscription ends. Returns the number of processed
    /// events and how the subscription ended.
    async fn consume(&mut self, mut sub: Box<dyn Subscription>) -> (u64, Result<(), StreamError>) {
        let mut processed = 0u64;
        loop {
            let next = self.scheduler.run_until(sub.next_line()).await;
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => return (processed, Ok(())),
                Err(e) => return (processed, Err(e)),
            };
            self.wait_for_flush().await;
            if self.process_line(&line) {
                processed += 1;
            }
        }
    }

    async fn wait_for_flush(&mut self) {
        let buffer = Arc::clone(self.scheduler.buffer());
        if !buffer.is_flushing() {
            return;
        }
        counter!("stream_backpressure_waits_total").increment(1);
        let limit = self.backpressure_log_after;
        while self
            .scheduler
            .run_until(tokio::time::timeout(limit, buffer.wait_until_idle()))
            .await
            .is_err()
        {
            tracing::warn!(
                waited_ms = limit.as_millis() as u64,
                "intake paused: flush still in flight"
            );
        }
    }

    /// Parse, normalize and buffer one raw line. `false` when skipped.
    pub fn process_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            // keep-alive
            return false;
        }
        counter!("stream_events_total").increment(1);

        let ev = match InboundEvent::parse(line) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed event");
                counter!("stream_events_skipped_total").increment(1);
                return false;
            }
        };
        let record = match self.normalizer.normalize(&ev) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(id = ev.id, error = %e, "skipping event with bad timestamp");
                counter!("stream_events_skipped_total").increment(1);
                return false;
            }
        };
        self.scheduler.append(record);
        true
    }
}
