//! Flush worker: writes batches with capped retries, then falls back or drops.
//!
//! Batches arrive over an `mpsc` channel, so the worker owns each batch
//! outright while it is being written. The ingest task never shares a batch
//! with it.

use crate::config::RetryConfig;
use crate::record::Batch;
use crate::sink::{FallbackStore, SinkError};
use crate::stats::PipelineStats;
use crate::writer::SinkWriter;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("Sink failed {consecutive} batches in a row; last error: {last_error}")]
    SinkExhausted {
        consecutive: u32,
        last_error: SinkError,
    },
}

/// Retry limits for one batch and for the sink as a whole.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Write attempts per batch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Batches in a row that may exhaust their retries before the worker
    /// gives up on the sink. Zero disables the limit.
    pub max_consecutive_failed_batches: u32,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_consecutive_failed_batches: config.max_consecutive_failed_batches,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// What finally happened to a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Persisted { records: usize, attempts: u32 },
    Fallback { path: PathBuf },
    Dropped { records: usize },
}

pub struct FlushWorker {
    writer: SinkWriter,
    fallback: Option<FallbackStore>,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
    consecutive_failures: u32,
}

impl FlushWorker {
    pub fn new(
        writer: SinkWriter,
        fallback: Option<FallbackStore>,
        policy: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            writer,
            fallback,
            policy,
            stats,
            consecutive_failures: 0,
        }
    }

    /// Consume batches until the channel closes.
    ///
    /// Returns an error once too many batches in a row have exhausted their
    /// retries. Batches still queued at that point go to the fallback store
    /// (or are dropped loudly) before returning.
    pub async fn run(mut self, mut batches: mpsc::Receiver<Batch>) -> Result<(), FlushError> {
        info!("Flush worker started");

        while let Some(batch) = batches.recv().await {
            if let Err(e) = self.flush(batch).await {
                batches.close();
                while let Ok(queued) = batches.try_recv() {
                    abandon(queued, self.fallback.as_ref(), &self.stats).await;
                }
                return Err(e);
            }
        }

        info!("Flush worker finished");
        Ok(())
    }

    /// Write one batch, retrying up to the policy's cap.
    ///
    /// Errors only when the sink as a whole is considered lost; the batch
    /// itself has already been persisted to the fallback or dropped.
    pub async fn flush(&mut self, batch: Batch) -> Result<FlushOutcome, FlushError> {
        match self.write_with_retry(batch).await {
            Ok(outcome) => {
                self.consecutive_failures = 0;
                Ok(outcome)
            }
            Err((pending, last_error)) => {
                self.consecutive_failures += 1;
                error!(
                    batch_id = %pending.id(),
                    records = pending.len(),
                    attempts = self.policy.max_attempts,
                    consecutive_failures = self.consecutive_failures,
                    error = %last_error,
                    "Batch could not be written to the sink"
                );

                let outcome = abandon(pending, self.fallback.as_ref(), &self.stats).await;

                let limit = self.policy.max_consecutive_failed_batches;
                if limit > 0 && self.consecutive_failures >= limit {
                    return Err(FlushError::SinkExhausted {
                        consecutive: self.consecutive_failures,
                        last_error,
                    });
                }
                Ok(outcome)
            }
        }
    }

    async fn write_with_retry(&self, batch: Batch) -> Result<FlushOutcome, (Batch, SinkError)> {
        let mut backoff = ExponentialBackoff {
            current_interval: self.policy.base_delay,
            initial_interval: self.policy.base_delay,
            max_interval: self.policy.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        let total = batch.len();
        let mut pending = batch;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match self.writer.write(&pending).await {
                Ok(ack) => {
                    self.stats.batch_flushed(ack.inserted as u64);
                    info!(
                        batch_id = %pending.id(),
                        records = total,
                        attempts,
                        "Batch persisted"
                    );
                    return Ok(FlushOutcome::Persisted {
                        records: total,
                        attempts,
                    });
                }
                Err(e) => e,
            };

            // Keep only the documents the sink says it rejected
            if let Some(failed) = error.failed_indices() {
                let stored = pending.len().saturating_sub(failed.len());
                self.stats.records_partially_persisted(stored as u64);
                match pending.subset(failed) {
                    Some(rest) => pending = rest,
                    None => {
                        self.stats.batch_flushed(0);
                        return Ok(FlushOutcome::Persisted {
                            records: total,
                            attempts,
                        });
                    }
                }
            }

            if attempts >= self.policy.max_attempts {
                return Err((pending, error));
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
            self.stats.flush_retry();
            warn!(
                batch_id = %pending.id(),
                records = pending.len(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Flush failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Give up on a batch: write it to the fallback store if there is one,
/// otherwise drop it with an error-level diagnostic.
pub async fn abandon(
    batch: Batch,
    fallback: Option<&FallbackStore>,
    stats: &PipelineStats,
) -> FlushOutcome {
    let records = batch.len();

    if let Some(store) = fallback {
        match store.persist(&batch).await {
            Ok(path) => {
                stats.batch_to_fallback(records as u64);
                warn!(
                    batch_id = %batch.id(),
                    records,
                    path = %path.display(),
                    "Batch written to fallback store"
                );
                return FlushOutcome::Fallback { path };
            }
            Err(e) => {
                error!(batch_id = %batch.id(), error = %e, "Fallback store failed");
            }
        }
    }

    stats.batch_dropped(records as u64);
    error!(
        batch_id = %batch.id(),
        records,
        first_captured_at = %batch.created_at(),
        "DROPPING BATCH: records are lost"
    );
    FlushOutcome::Dropped { records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::sink::memory::{InMemorySink, ScriptedFailure};
    use chrono::Utc;

    fn batch(values: std::ops::Range<i64>) -> Batch {
        Batch::from_records(values.map(|v| Record::new(vec![v], Utc::now())).collect()).unwrap()
    }

    fn policy(max_attempts: u32, max_consecutive: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_consecutive_failed_batches: max_consecutive,
        }
    }

    fn worker(
        sink: Arc<InMemorySink>,
        fallback: Option<FallbackStore>,
        policy: RetryPolicy,
    ) -> (FlushWorker, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let writer = SinkWriter::new(sink, Duration::from_secs(5));
        (
            FlushWorker::new(writer, fallback, policy, stats.clone()),
            stats,
        )
    }

    fn unavailable() -> ScriptedFailure {
        ScriptedFailure::Error(SinkError::Unavailable("connection refused".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(InMemorySink::new());
        sink.push_failure(unavailable());
        sink.push_failure(unavailable());
        let (mut worker, stats) = worker(sink.clone(), None, policy(5, 3));

        let outcome = worker.flush(batch(0..4)).await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Persisted {
                records: 4,
                attempts: 3
            }
        );
        assert_eq!(sink.documents().len(), 4);
        assert_eq!(stats.snapshot().flush_retries, 2);
        assert_eq!(stats.snapshot().records_persisted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_retries_only_rejected_subset() {
        let sink = Arc::new(InMemorySink::new());
        sink.push_failure(ScriptedFailure::RejectIndices(vec![1, 3]));
        let (mut worker, stats) = worker(sink.clone(), None, policy(3, 3));

        worker.flush(batch(0..5)).await.unwrap();

        let mut values: Vec<i64> = sink.documents().iter().flat_map(|d| d.values()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(sink.insert_sizes(), vec![3, 2]);
        assert_eq!(stats.snapshot().records_persisted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_is_dropped_loudly_without_fallback() {
        let sink = Arc::new(InMemorySink::new());
        for _ in 0..3 {
            sink.push_failure(unavailable());
        }
        let (mut worker, stats) = worker(sink.clone(), None, policy(3, 0));

        let outcome = worker.flush(batch(0..6)).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Dropped { records: 6 });
        assert_eq!(stats.snapshot().records_dropped, 6);
        assert_eq!(stats.snapshot().flush_retries, 2);
        assert!(sink.documents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_goes_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = FallbackStore::open(dir.path()).await.unwrap();
        let sink = Arc::new(InMemorySink::new());
        sink.push_failure(unavailable());
        let (mut worker, stats) = worker(sink, Some(store), policy(1, 0));

        match worker.flush(batch(0..2)).await.unwrap() {
            FlushOutcome::Fallback { path } => assert!(path.exists()),
            other => panic!("expected fallback, got {:?}", other),
        }
        assert_eq!(stats.snapshot().batches_fallback, 1);
        assert_eq!(stats.snapshot().records_fallback, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_escalate() {
        let sink = Arc::new(InMemorySink::new());
        for _ in 0..4 {
            sink.push_failure(unavailable());
        }
        let (mut worker, _stats) = worker(sink, None, policy(2, 2));

        assert!(worker.flush(batch(0..1)).await.is_ok());
        assert!(matches!(
            worker.flush(batch(1..2)).await,
            Err(FlushError::SinkExhausted { consecutive: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let sink = Arc::new(InMemorySink::new());
        sink.push_failure(unavailable());
        let (mut worker, _stats) = worker(sink.clone(), None, policy(1, 2));

        // First batch exhausts its single attempt, second succeeds
        assert!(worker.flush(batch(0..1)).await.is_ok());
        assert!(worker.flush(batch(1..2)).await.is_ok());

        sink.push_failure(unavailable());
        assert!(worker.flush(batch(2..3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_after_escalation() {
        let sink = Arc::new(InMemorySink::new());
        sink.push_failure(unavailable());
        let (worker, stats) = worker(sink, None, policy(1, 1));

        let (tx, rx) = mpsc::channel(4);
        tx.send(batch(0..2)).await.unwrap();
        tx.send(batch(2..5)).await.unwrap();

        let result = worker.run(rx).await;
        assert!(matches!(result, Err(FlushError::SinkExhausted { .. })));

        // Both batches are accounted for: one failed, one drained
        assert_eq!(stats.snapshot().records_dropped, 5);
        assert!(tx.send(batch(5..6)).await.is_err());
    }

    #[tokio::test]
    async fn test_run_finishes_when_channel_closes() {
        let sink = Arc::new(InMemorySink::new());
        let (worker, stats) = worker(sink.clone(), None, RetryPolicy::default());

        let (tx, rx) = mpsc::channel(4);
        tx.send(batch(0..3)).await.unwrap();
        drop(tx);

        worker.run(rx).await.unwrap();
        assert_eq!(stats.snapshot().batches_flushed, 1);
        assert_eq!(sink.documents().len(), 3);
    }
}
