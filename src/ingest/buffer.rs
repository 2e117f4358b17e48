//! # Micro-batch Buffer
//! In-memory sequence of normalized records awaiting delivery, with derived
//! counters (record count, serialized byte size, oldest enqueue instant).
//!
//! The sequence and its counters live behind one mutex so they are always
//! consistent; `snapshot_and_clear` swaps the whole sequence out under that
//! lock, so a record lands in exactly one payload. Serialization and the
//! network call happen after the lock is released.
//!
//! The "flush in progress" flag is a `watch` channel so intake can await
//! the end of a flush instead of polling it.

use std::sync::{Arc, Mutex, MutexGuard};

use metrics::gauge;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ingest::payload;
use crate::ingest::types::NormalizedRecord;

/// Counters observed right after an `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub record_count: usize,
    pub byte_size: usize,
    /// The buffer was empty before this record (empty -> non-empty transition).
    pub was_empty: bool,
    pub generation: u64,
}

/// Everything taken out of the buffer by one snapshot.
#[derive(Debug, Clone)]
pub struct Batch {
    pub payload: String,
    pub record_count: usize,
    pub byte_size: usize,
    pub generation: u64,
    pub oldest_enqueued_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<NormalizedRecord>,
    bytes: usize,
    oldest: Option<Instant>,
    /// Bumped on every snapshot; identifies the contents a timer was armed for.
    generation: u64,
}

#[derive(Debug)]
pub struct MicroBatchBuffer {
    inner: Mutex<Inner>,
    flushing: watch::Sender<bool>,
}

impl Default for MicroBatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MicroBatchBuffer {
    pub fn new() -> Self {
        let (flushing, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner::default()),
            flushing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain data; a panic elsewhere cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add to the tail. Never blocks on a flush.
    pub fn append(&self, record: NormalizedRecord) -> AppendOutcome {
        let size = payload::row_size(&record);
        let mut inner = self.lock();
        let was_empty = inner.records.is_empty();
        if was_empty {
            inner.oldest = Some(Instant::now());
        }
        inner.records.push(record);
        inner.bytes += size;

        gauge!("buffer_records").set(inner.records.len() as f64);
        gauge!("buffer_bytes").set(inner.bytes as f64);

        AppendOutcome {
            record_count: inner.records.len(),
            byte_size: inner.bytes,
            was_empty,
            generation: inner.generation,
        }
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.lock().bytes
    }

    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.lock().oldest
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Take the whole sequence and reset counters. `None` when empty.
    pub fn snapshot_and_clear(&self) -> Option<Batch> {
        let mut inner = self.lock();
        Self::take(&mut inner).map(Self::seal)
    }

    /// Start a flush: atomically refuse if one is already in flight or the
    /// buffer is empty, otherwise snapshot and raise the flushing flag.
    /// The flag drops when the returned permit is dropped.
    pub fn begin_flush(self: &Arc<Self>) -> Option<(Batch, FlushPermit)> {
        let taken = {
            let mut inner = self.lock();
            if *self.flushing.borrow() {
                return None;
            }
            let taken = Self::take(&mut inner)?;
            self.flushing.send_replace(true);
            taken
        };
        let permit = FlushPermit {
            buffer: Arc::clone(self),
        };
        Some((Self::seal(taken), permit))
    }

    /// True from the start of a flush until its delivery call returns.
    pub fn is_flushing(&self) -> bool {
        *self.flushing.borrow()
    }

    /// Resolves once no flush is in flight.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.flushing.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|flushing| !*flushing).await;
    }

    fn take(inner: &mut Inner) -> Option<Taken> {
        if inner.records.is_empty() {
            return None;
        }
        let taken = Taken {
            records: std::mem::take(&mut inner.records),
            bytes: std::mem::replace(&mut inner.bytes, 0),
            oldest: inner.oldest.take(),
            generation: inner.generation,
        };
        inner.generation += 1;

        gauge!("buffer_records").set(0.0);
        gauge!("buffer_bytes").set(0.0);
        Some(taken)
    }

    fn seal(t: Taken) -> Batch {
        Batch {
            payload: payload::encode_batch(&t.records),
            record_count: t.records.len(),
            byte_size: t.bytes,
            generation: t.generation,
            oldest_enqueued_at: t.oldest,
        }
    }
}

struct Taken {
    records: Vec<NormalizedRecord>,
    bytes: usize,
    oldest: Option<Instant>,
    generation: u64,
}

/// Held for the duration of one flush; releases the flushing flag on drop
/// (also when the delivery task panics).
#[derive(Debug)]
pub struct FlushPermit {
    buffer: Arc<MicroBatchBuffer>,
}

impl Drop for FlushPermit {
    fn drop(&mut self) {
        self.buffer.flushing.send_replace(false);
    }
}
