//! Pipeline orchestration.
//!
//! ```text
//! StreamSource -> LineReader -> RecordParser -> Batcher --mpsc--> FlushWorker -> DocumentSink
//!                                                                    |
//!                                                                    +-> FallbackStore
//! ```
//!
//! One task reads, parses and batches; a second task flushes. The ingest
//! task owns the in-progress batch and the connection state; finished
//! batches are moved to the flush worker over a bounded channel.

use crate::batcher::{AddOutcome, Batcher};
use crate::config::IngestConfig;
use crate::flusher::{abandon, FlushError, FlushWorker, RetryPolicy};
use crate::line_reader::{LineReader, ReadOutcome};
use crate::parser::{ParseOutcome, RecordParser};
use crate::record::Batch;
use crate::sink::{DocumentSink, FallbackStore, SinkError};
use crate::source::StreamSource;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::writer::SinkWriter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open stream {target}: {message}")]
    StreamStartup { target: String, message: String },

    #[error("Sink {target} is unreachable: {source}")]
    SinkStartup {
        target: String,
        #[source]
        source: SinkError,
    },

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error(transparent)]
    Flush(#[from] FlushError),

    #[error("Flush worker stopped unexpectedly: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Startup failures are fatal and never retried.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::StreamStartup { .. } | PipelineError::SinkStartup { .. }
        )
    }
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    StreamConnected,
    SinkConnected,
    Running,
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, StreamConnected)
                | (StreamConnected, SinkConnected)
                | (SinkConnected, Running)
                | (Running, Draining)
                | (Draining, Closed)
                | (Disconnected, Closed)
                | (StreamConnected, Closed)
        )
    }
}

/// Why the ingest loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    EndOfStream,
    WorkerExited,
}

/// Runtime settings, derived from [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
    pub drain_timeout: Duration,
    pub read_timeout: Duration,
    pub max_line_bytes: usize,
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
    /// Periodic statistics log line; `None` logs only at shutdown.
    pub stats_interval: Option<Duration>,
}

impl PipelineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_batch_size: config.batching.max_batch_size,
            flush_interval: config.batching.flush_interval(),
            channel_capacity: config.batching.channel_capacity.max(1),
            drain_timeout: config.batching.drain_timeout(),
            read_timeout: config.serial.read_timeout(),
            max_line_bytes: config.serial.max_line_bytes,
            write_timeout: config.sink.write_timeout(),
            retry: RetryPolicy::from(&config.retry),
            stats_interval: match config.logging.stats_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub stats: StatsSnapshot,
}

type WorkerHandle = JoinHandle<Result<(), FlushError>>;

pub struct Pipeline {
    settings: PipelineSettings,
    parser: RecordParser,
    batcher: Batcher,
    state: ConnectionState,
    stats: Arc<PipelineStats>,
    fallback: Option<FallbackStore>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, parser: RecordParser) -> Self {
        let batcher = Batcher::new(settings.max_batch_size, settings.flush_interval);
        Self {
            settings,
            parser,
            batcher,
            state: ConnectionState::Disconnected,
            stats: Arc::new(PipelineStats::new()),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, store: FallbackStore) -> Self {
        self.fallback = Some(store);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until shutdown, end of stream, or sink exhaustion.
    ///
    /// The stream is released and the sink closed exactly once on every
    /// path out of this function, including startup failures.
    pub async fn run<S>(
        &mut self,
        source: &S,
        sink: Arc<dyn DocumentSink>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, PipelineError>
    where
        S: StreamSource,
    {
        if self.state != ConnectionState::Disconnected {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: ConnectionState::StreamConnected,
            });
        }

        let stream = match source.open().await {
            Ok(stream) => stream,
            Err(e) => {
                sink.close().await;
                self.transition(ConnectionState::Closed)?;
                return Err(PipelineError::StreamStartup {
                    target: source.describe(),
                    message: e.to_string(),
                });
            }
        };
        self.transition(ConnectionState::StreamConnected)?;
        info!(stream = %source.describe(), "Stream connected");

        let mut reader = LineReader::new(
            stream,
            self.settings.read_timeout,
            self.settings.max_line_bytes,
        );

        if let Err(e) = sink.ping().await {
            drop(reader);
            sink.close().await;
            self.transition(ConnectionState::Closed)?;
            return Err(PipelineError::SinkStartup {
                target: sink.describe(),
                source: e,
            });
        }
        self.transition(ConnectionState::SinkConnected)?;
        info!(sink = %sink.describe(), "Sink connected");

        let writer = SinkWriter::new(sink.clone(), self.settings.write_timeout);
        let worker = FlushWorker::new(
            writer,
            self.fallback.clone(),
            self.settings.retry.clone(),
            self.stats.clone(),
        );
        let (batch_tx, batch_rx) = mpsc::channel(self.settings.channel_capacity);
        let mut worker_handle: WorkerHandle = tokio::spawn(worker.run(batch_rx));

        self.transition(ConnectionState::Running)?;
        info!(
            max_batch_size = self.settings.max_batch_size,
            flush_interval_secs = self.settings.flush_interval.as_secs(),
            arity = self.parser.arity(),
            "Pipeline running"
        );

        let (stop_reason, worker_result) = self
            .ingest(&mut reader, &batch_tx, &mut worker_handle, &shutdown)
            .await;

        self.transition(ConnectionState::Draining)?;
        info!(reason = ?stop_reason, buffered = self.batcher.len(), "Draining pipeline");

        let discarded = reader.discard_partial();
        if discarded > 0 {
            warn!(bytes = discarded, "Discarded unterminated line at shutdown");
        }
        drop(reader);

        let worker_result = match worker_result {
            Some(result) => {
                // The worker is gone; whatever is still buffered cannot be written
                if let Some(batch) = self.batcher.force_flush() {
                    abandon(batch, self.fallback.as_ref(), &self.stats).await;
                }
                result
            }
            None => self.drain(batch_tx, worker_handle).await,
        };

        sink.close().await;
        self.transition(ConnectionState::Closed)?;

        let stats = self.stats.snapshot();
        log_stats(&stats, "Final pipeline statistics");
        worker_result?;

        Ok(RunSummary { stop_reason, stats })
    }

    /// Read, parse and batch until something stops the loop.
    ///
    /// Returns the worker's result too when the worker is what stopped it.
    async fn ingest<R>(
        &mut self,
        reader: &mut LineReader<R>,
        batch_tx: &mpsc::Sender<Batch>,
        worker: &mut WorkerHandle,
        shutdown: &CancellationToken,
    ) -> (StopReason, Option<Result<(), PipelineError>>)
    where
        R: AsyncRead + Unpin,
    {
        let mut stats_ticker = self.settings.stats_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let deadline = self.batcher.flush_deadline();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return (StopReason::Shutdown, None);
                }

                joined = &mut *worker => {
                    let result = flatten_join(joined);
                    if let Err(ref e) = result {
                        error!(error = %e, "Flush worker stopped");
                    }
                    return (StopReason::WorkerExited, Some(result));
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.batcher.force_flush() {
                        debug!(records = batch.len(), "Flush interval elapsed");
                        self.dispatch(batch_tx, batch).await;
                    }
                }

                _ = tick(&mut stats_ticker) => {
                    log_stats(&self.stats.snapshot(), "Pipeline statistics");
                }

                outcome = reader.next_line() => match outcome {
                    ReadOutcome::Line(line) => {
                        self.stats.line_read();
                        self.handle_line(&line, batch_tx).await;
                    }
                    ReadOutcome::Idle => self.stats.idle_poll(),
                    ReadOutcome::EndOfStream => {
                        info!("Stream reached end of file");
                        return (StopReason::EndOfStream, None);
                    }
                    ReadOutcome::TransientError(e) => {
                        self.stats.read_fault();
                        warn!(error = %e, "Skipping unreadable input");
                    }
                },
            }
        }
    }

    async fn handle_line(&mut self, line: &str, batch_tx: &mpsc::Sender<Batch>) {
        match self.parser.parse(line) {
            ParseOutcome::Record(record) => {
                self.stats.record_accepted();
                if let AddOutcome::BatchReady(batch) = self.batcher.add(record) {
                    debug!(records = batch.len(), "Batch size reached");
                    self.dispatch(batch_tx, batch).await;
                }
            }
            ParseOutcome::Unmatched => {
                self.stats.line_unmatched();
                debug!(line = %line, "Line did not match the template");
            }
            ParseOutcome::Malformed { line, field } => {
                self.stats.line_malformed();
                warn!(
                    line = %line,
                    field = %field,
                    "Could not convert field to an integer, skipping line"
                );
            }
        }
    }

    /// Hand a batch to the flush worker.
    ///
    /// Waits while the channel is full. The worker always finishes each
    /// batch within its retry cap, so the wait is bounded.
    async fn dispatch(&self, batch_tx: &mpsc::Sender<Batch>, batch: Batch) {
        if let Err(mpsc::error::SendError(batch)) = batch_tx.send(batch).await {
            abandon(batch, self.fallback.as_ref(), &self.stats).await;
        }
    }

    /// Flush what is buffered, close the channel, and wait for the worker.
    async fn drain(
        &mut self,
        batch_tx: mpsc::Sender<Batch>,
        mut worker: WorkerHandle,
    ) -> Result<(), PipelineError> {
        if let Some(batch) = self.batcher.force_flush() {
            info!(records = batch.len(), "Flushing buffered records");
            self.dispatch(&batch_tx, batch).await;
        }
        drop(batch_tx);

        match tokio::time::timeout(self.settings.drain_timeout, &mut worker).await {
            Ok(joined) => flatten_join(joined),
            Err(_) => {
                worker.abort();
                error!(
                    timeout_secs = self.settings.drain_timeout.as_secs(),
                    records = self.stats.records_unaccounted(),
                    "Flush worker did not finish in time; in-flight records may be lost"
                );
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "Pipeline state change");
        self.state = next;
        Ok(())
    }
}

fn flatten_join(
    joined: Result<Result<(), FlushError>, tokio::task::JoinError>,
) -> Result<(), PipelineError> {
    match joined {
        Ok(result) => result.map_err(PipelineError::from),
        Err(e) => Err(PipelineError::Worker(e.to_string())),
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Log a statistics snapshot.
pub fn log_stats(stats: &StatsSnapshot, message: &str) {
    info!(
        lines_read = stats.lines_read,
        idle_polls = stats.idle_polls,
        lines_unmatched = stats.lines_unmatched,
        lines_malformed = stats.lines_malformed,
        read_faults = stats.read_faults,
        records_accepted = stats.records_accepted,
        batches_flushed = stats.batches_flushed,
        records_persisted = stats.records_persisted,
        flush_retries = stats.flush_retries,
        batches_fallback = stats.batches_fallback,
        records_fallback = stats.records_fallback,
        batches_dropped = stats.batches_dropped,
        records_dropped = stats.records_dropped,
        "{}",
        message
    );
}
