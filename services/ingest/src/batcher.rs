//! Record accumulation with size and age triggers.
//!
//! Records are accumulated until either:
//! - the batch reaches `max_batch_size` (size-based flush), or
//! - the oldest buffered record has waited `flush_interval` (time-based flush).

use crate::record::{Batch, Record};
use std::time::Duration;
use tokio::time::Instant;

/// Result of adding a record.
#[derive(Debug)]
pub enum AddOutcome {
    Accepted,
    /// The batch filled up and was detached; a new empty batch is open.
    BatchReady(Batch),
}

/// In-memory batch accumulator.
///
/// Detaching happens under `&mut self`, so a size-triggered and a
/// time-triggered flush can never both take the same records.
#[derive(Debug)]
pub struct Batcher {
    records: Vec<Record>,
    max_batch_size: usize,
    flush_interval: Duration,
    opened_at: Option<Instant>,
}

impl Batcher {
    pub fn new(max_batch_size: usize, flush_interval: Duration) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            records: Vec::with_capacity(max_batch_size.min(4096)),
            max_batch_size,
            flush_interval,
            opened_at: None,
        }
    }

    /// Append a record, returning the full batch if this filled it.
    pub fn add(&mut self, record: Record) -> AddOutcome {
        if self.records.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.records.push(record);

        if self.records.len() >= self.max_batch_size {
            match self.detach() {
                Some(batch) => AddOutcome::BatchReady(batch),
                None => AddOutcome::Accepted,
            }
        } else {
            AddOutcome::Accepted
        }
    }

    /// Detach whatever is buffered. `None` when empty: batches are never empty.
    pub fn force_flush(&mut self) -> Option<Batch> {
        self.detach()
    }

    /// When the current batch becomes due for a time-based flush.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.flush_interval)
    }

    /// Check if a time-based flush is due.
    pub fn flush_due(&self, now: Instant) -> bool {
        self.flush_deadline()
            .is_some_and(|deadline| now >= deadline)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn detach(&mut self) -> Option<Batch> {
        self.opened_at = None;
        let records = std::mem::replace(
            &mut self.records,
            Vec::with_capacity(self.max_batch_size.min(4096)),
        );
        Batch::from_records(records)
    }
}
