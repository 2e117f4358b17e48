// src/ingest/scheduler.rs
//! Flush scheduler: owns the three flush triggers (time, record count,
//! byte size) and starts flushes of the shared buffer.
//!
//! Count and byte triggers are checked inside `append`, so the snapshot
//! happens synchronously within the call that crossed the threshold. The
//! time trigger is a single-shot timer task armed when the buffer becomes
//! non-empty; it never touches the buffer itself but posts a
//! `SchedulerSignal::Deadline` back to the scheduler's owner, which services
//! signals in `run_until`. Delivery runs on its own task so intake only ever
//! waits for the snapshot, and reports back with `SchedulerSignal::Delivered`.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::FlushConfig;
use crate::delivery::{DeliveryClient, DeliveryOutcome, Destination};
use crate::ingest::buffer::{AppendOutcome, MicroBatchBuffer};
use crate::ingest::types::NormalizedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Time,
    Count,
    Bytes,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Time => "time",
            FlushTrigger::Count => "count",
            FlushTrigger::Bytes => "bytes",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub records: usize,
    pub bytes: usize,
    pub generation: u64,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug)]
pub enum SchedulerSignal {
    /// The time window for buffer generation `generation` elapsed.
    Deadline { generation: u64 },
    /// An in-flight flush finished (delivered or dropped).
    Delivered(FlushReport),
}

/// Running totals, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes_started: u64,
    pub batches_delivered: u64,
    pub batches_dropped: u64,
    pub records_delivered: u64,
    pub records_dropped: u64,
}

pub struct FlushScheduler {
    cfg: FlushConfig,
    buffer: Arc<MicroBatchBuffer>,
    client: DeliveryClient,
    dest: Arc<Destination>,
    timer: Option<JoinHandle<()>>,
    /// Delivery task of the current flush, keyed by the generation it carries.
    in_flight: Option<(u64, JoinHandle<()>)>,
    signals_tx: mpsc::UnboundedSender<SchedulerSignal>,
    signals_rx: mpsc::UnboundedReceiver<SchedulerSignal>,
    stats: FlushStats,
}

impl FlushScheduler {
    pub fn new(
        cfg: FlushConfig,
        buffer: Arc<MicroBatchBuffer>,
        client: DeliveryClient,
        dest: Destination,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            buffer,
            client,
            dest: Arc::new(dest),
            timer: None,
            in_flight: None,
            signals_tx,
            signals_rx,
            stats: FlushStats::default(),
        }
    }

    pub fn buffer(&self) -> &Arc<MicroBatchBuffer> {
        &self.buffer
    }

    pub fn config(&self) -> &FlushConfig {
        &self.cfg
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn flush_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Buffer a record and evaluate the count/byte triggers. Returns the
    /// trigger when this call started a flush.
    pub fn append(&mut self, record: NormalizedRecord) -> Option<FlushTrigger> {
        let out = self.buffer.append(record);

        if let Some(trigger) = self.size_trigger(&out) {
            if self.flush(trigger) {
                return Some(trigger);
            }
            tracing::debug!(
                trigger = trigger.as_str(),
                records = out.record_count,
                "trigger fired while a flush is in flight; accumulating"
            );
        }

        if self.timer.is_none() {
            self.arm_timer(out.generation);
        }
        None
    }

    fn size_trigger(&self, out: &AppendOutcome) -> Option<FlushTrigger> {
        if out.record_count >= self.cfg.max_records {
            Some(FlushTrigger::Count)
        } else if out.byte_size >= self.cfg.max_bytes {
            Some(FlushTrigger::Bytes)
        } else {
            None
        }
    }

    /// Snapshot the buffer and hand the payload to a delivery task.
    /// `false` when the buffer is empty or a flush is already in flight.
    pub fn flush(&mut self, trigger: FlushTrigger) -> bool {
        let Some((batch, permit)) = self.buffer.begin_flush() else {
            return false;
        };
        self.cancel_timer();
        self.stats.flushes_started += 1;
        counter!("flush_total", "trigger" => trigger.as_str()).increment(1);

        let waited_ms = batch
            .oldest_enqueued_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default();
        tracing::info!(
            trigger = trigger.as_str(),
            records = batch.record_count,
            bytes = batch.byte_size,
            waited_ms,
            "flushing buffer"
        );

        let client = self.client.clone();
        let dest = Arc::clone(&self.dest);
        let tx = self.signals_tx.clone();
        let generation = batch.generation;
        let handle = tokio::spawn(async move {
            let outcome = client.deliver(&batch.payload, &dest).await;
            // Intake may resume before the owner sees the report.
            drop(permit);

            let report = FlushReport {
                trigger,
                records: batch.record_count,
                bytes: batch.byte_size,
                generation: batch.generation,
                outcome,
            };
            let _ = tx.send(SchedulerSignal::Delivered(report));
        });
        self.in_flight = Some((generation, handle));
        true
    }

    /// Await `fut` while servicing timer deadlines and delivery reports.
    pub async fn run_until<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal),
            }
        }
    }

    pub fn handle_signal(&mut self, signal: SchedulerSignal) {
        match signal {
            SchedulerSignal::Deadline { generation } => {
                if generation != self.buffer.generation() {
                    // Armed for contents that were already flushed.
                    return;
                }
                self.timer = None;
                if !self.flush(FlushTrigger::Time) {
                    tracing::debug!("time trigger fired while a flush is in flight");
                }
            }
            SchedulerSignal::Delivered(report) => {
                // Intake may have started the next flush before this report
                // was serviced; only the matching one is finished.
                if matches!(self.in_flight, Some((g, _)) if g == report.generation) {
                    self.in_flight = None;
                }
                self.record_report(&report);
                self.after_flush();
            }
        }
    }

    fn record_report(&mut self, report: &FlushReport) {
        let reason = match &report.outcome {
            DeliveryOutcome::Delivered { attempts } => {
                self.stats.batches_delivered += 1;
                self.stats.records_delivered += report.records as u64;
                counter!("flush_records_total").increment(report.records as u64);
                tracing::info!(
                    trigger = report.trigger.as_str(),
                    records = report.records,
                    attempts,
                    "batch delivered"
                );
                return;
            }
            DeliveryOutcome::Rejected { status, .. } => format!("rejected with HTTP {status}"),
            DeliveryOutcome::Exhausted { last_error, .. } => {
                format!("retries exhausted: {last_error}")
            }
        };

        // Not re-queued: memory stays bounded when the endpoint keeps failing.
        self.stats.batches_dropped += 1;
        self.stats.records_dropped += report.records as u64;
        counter!("flush_dropped_total").increment(1);
        counter!("flush_dropped_records_total").increment(report.records as u64);
        tracing::warn!(
            trigger = report.trigger.as_str(),
            records = report.records,
            bytes = report.bytes,
            attempts = report.outcome.attempts(),
            reason = %reason,
            "dropping batch"
        );
    }

    /// Records buffered while the flush was in flight either cross a
    /// threshold now or get a fresh timer.
    fn after_flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let out = AppendOutcome {
            record_count: self.buffer.record_count(),
            byte_size: self.buffer.approximate_byte_size(),
            was_empty: false,
            generation: self.buffer.generation(),
        };
        if let Some(trigger) = self.size_trigger(&out) {
            if self.flush(trigger) {
                return;
            }
        }
        if self.timer.is_none() {
            self.arm_timer(out.generation);
        }
    }

    fn arm_timer(&mut self, generation: u64) {
        let oldest = self
            .buffer
            .oldest_enqueued_at()
            .unwrap_or_else(Instant::now);
        let deadline = oldest + self.cfg.max_wait;
        let tx = self.signals_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(SchedulerSignal::Deadline { generation });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Best-effort drain on process stop: wait for the in-flight flush, then
    /// flush whatever is left and wait for that delivery too.
    pub async fn shutdown(mut self) -> FlushStats {
        self.cancel_timer();
        self.await_in_flight().await;
        if self.flush(FlushTrigger::Shutdown) {
            self.await_in_flight().await;
        }
        self.cancel_timer();
        self.stats
    }

    async fn await_in_flight(&mut self) {
        if let Some((_, handle)) = self.in_flight.take() {
            let _ = handle.await;
        }
        // A delivery task that panicked still released its permit.
        self.buffer.wait_until_idle().await;
        while let Ok(signal) = self.signals_rx.try_recv() {
            if let SchedulerSignal::Delivered(report) = signal {
                self.record_report(&report);
            }
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::delivery::IngestTransport;
    use crate::error::DeliveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IngestTransport for Counting {
        async fn post_csv(&self, _d: &Destination, _p: &str) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn rec(id: u64) -> NormalizedRecord {
        NormalizedRecord {
            id,
            timestamp: "2020-01-01 00:00:00".into(),
            text: "x".into(),
            tag: "t".into(),
            polarity: 0.0,
        }
    }

    fn scheduler(cfg: FlushConfig) -> (FlushScheduler, Arc<Counting>) {
        let transport = Arc::new(Counting::default());
        let client = DeliveryClient::new(transport.clone(), RetryPolicy::default());
        let dest = Destination {
            api_url: "http://localhost".into(),
            datasource: "tweets".into(),
            token: "t".into(),
        };
        let s = FlushScheduler::new(cfg, Arc::new(MicroBatchBuffer::new()), client, dest);
        (s, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deadline_is_ignored() {
        let (mut s, t) = scheduler(FlushConfig {
            max_wait: Duration::from_secs(5),
            max_records: 100,
            max_bytes: 1 << 20,
        });
        s.append(rec(1));
        assert!(s.flush(FlushTrigger::Count));
        s.append(rec(2));
        // Deadline for generation 0 arrives after that generation was flushed.
        s.handle_signal(SchedulerSignal::Deadline { generation: 0 });
        assert_eq!(s.buffer().record_count(), 1);
        s.run_until(tokio::time::sleep(Duration::from_millis(1))).await;
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_leftovers() {
        let (mut s, t) = scheduler(FlushConfig::default());
        s.append(rec(1));
        s.append(rec(2));
        let stats = s.shutdown().await;
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.records_delivered, 2);
    }
}
