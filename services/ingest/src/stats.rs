//! Pipeline counters.
//!
//! Each counter is mirrored to the `metrics` facade, which is a no-op unless
//! an exporter has been installed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_read: AtomicU64,
    idle_polls: AtomicU64,
    read_faults: AtomicU64,
    lines_unmatched: AtomicU64,
    lines_malformed: AtomicU64,
    records_accepted: AtomicU64,
    batches_flushed: AtomicU64,
    records_persisted: AtomicU64,
    flush_retries: AtomicU64,
    batches_fallback: AtomicU64,
    records_fallback: AtomicU64,
    batches_dropped: AtomicU64,
    records_dropped: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub lines_read: u64,
    pub idle_polls: u64,
    pub read_faults: u64,
    pub lines_unmatched: u64,
    pub lines_malformed: u64,
    pub records_accepted: u64,
    pub batches_flushed: u64,
    pub records_persisted: u64,
    pub flush_retries: u64,
    pub batches_fallback: u64,
    pub records_fallback: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn line_read(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.lines.read").increment(1);
    }

    #[inline]
    pub fn idle_poll(&self) {
        self.idle_polls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.reads.idle").increment(1);
    }

    #[inline]
    pub fn read_fault(&self) {
        self.read_faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.lines.faults").increment(1);
    }

    #[inline]
    pub fn line_unmatched(&self) {
        self.lines_unmatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.lines.unmatched").increment(1);
    }

    #[inline]
    pub fn line_malformed(&self) {
        self.lines_malformed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.lines.malformed").increment(1);
    }

    #[inline]
    pub fn record_accepted(&self) {
        self.records_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.records.accepted").increment(1);
    }

    pub fn batch_flushed(&self, records: u64) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.records_persisted.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("ingest.batches.flushed").increment(1);
        metrics::counter!("ingest.records.persisted").increment(records);
    }

    /// Documents stored by a write that failed for the rest of its batch.
    pub fn records_partially_persisted(&self, records: u64) {
        self.records_persisted.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("ingest.records.persisted").increment(records);
    }

    pub fn flush_retry(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.batches.retries").increment(1);
    }

    pub fn batch_to_fallback(&self, records: u64) {
        self.batches_fallback.fetch_add(1, Ordering::Relaxed);
        self.records_fallback.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("ingest.batches.fallback").increment(1);
        metrics::counter!("ingest.records.fallback").increment(records);
    }

    pub fn batch_dropped(&self, records: u64) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.records_dropped.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("ingest.batches.dropped").increment(1);
        metrics::counter!("ingest.records.dropped").increment(records);
    }

    /// Accepted records with no recorded outcome yet (buffered or in flight).
    pub fn records_unaccounted(&self) -> u64 {
        let s = self.snapshot();
        s.records_accepted
            .saturating_sub(s.records_persisted + s.records_fallback + s.records_dropped)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            read_faults: self.read_faults.load(Ordering::Relaxed),
            lines_unmatched: self.lines_unmatched.load(Ordering::Relaxed),
            lines_malformed: self.lines_malformed.load(Ordering::Relaxed),
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            batches_fallback: self.batches_fallback.load(Ordering::Relaxed),
            records_fallback: self.records_fallback.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.line_read();
        stats.line_read();
        stats.line_unmatched();
        stats.record_accepted();
        stats.batch_flushed(10);
        stats.batch_dropped(4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.lines_read, 2);
        assert_eq!(snapshot.lines_unmatched, 1);
        assert_eq!(snapshot.records_accepted, 1);
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(snapshot.records_persisted, 10);
        assert_eq!(snapshot.records_dropped, 4);
        assert_eq!(snapshot.batches_fallback, 0);
    }

    #[test]
    fn test_every_counter_reaches_snapshot() {
        let stats = PipelineStats::new();
        stats.line_read();
        stats.idle_poll();
        stats.read_fault();
        stats.line_unmatched();
        stats.line_malformed();
        stats.record_accepted();
        stats.batch_flushed(2);
        stats.records_partially_persisted(1);
        stats.flush_retry();
        stats.batch_to_fallback(3);
        stats.batch_dropped(4);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                lines_read: 1,
                idle_polls: 1,
                read_faults: 1,
                lines_unmatched: 1,
                lines_malformed: 1,
                records_accepted: 1,
                batches_flushed: 1,
                records_persisted: 3,
                flush_retries: 1,
                batches_fallback: 1,
                records_fallback: 3,
                batches_dropped: 1,
                records_dropped: 4,
            }
        );
    }

    #[test]
    fn test_unaccounted_records() {
        let stats = PipelineStats::new();
        for _ in 0..10 {
            stats.record_accepted();
        }
        stats.batch_flushed(4);
        stats.batch_to_fallback(3);
        assert_eq!(stats.records_unaccounted(), 3);

        stats.batch_dropped(3);
        assert_eq!(stats.records_unaccounted(), 0);
    }
}
