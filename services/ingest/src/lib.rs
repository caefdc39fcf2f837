//! Telemetry Ingest Service
//!
//! Reads newline-delimited text from a microcontroller over a serial link,
//! extracts integer readings with a configurable line template, and writes
//! them to a document store in batches.
//!
//! ## Features
//!
//! - **Bounded reads**: every read has a timeout, so an idle link never
//!   blocks shutdown or the flush interval
//! - **Size and age batching**: a batch is flushed when it is full or when
//!   its oldest record is older than the flush interval
//! - **Capped retries**: failed writes back off exponentially, then spill
//!   to a JSONL fallback directory or are dropped with an error log
//! - **Graceful shutdown**: buffered records are flushed and the sink is
//!   closed exactly once, on every exit path
//!
//! ## Architecture
//!
//! ```text
//!  Serial port / stdin
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ LineReader   │────▶│ RecordParser │────▶│ Batcher      │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                                                  │ mpsc
//!                                                  ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ MongoDB      │◀────│ FlushWorker  │
//!                      └──────────────┘     └──────────────┘
//!                                                  │ retries exhausted
//!                                                  ▼
//!                                           ┌──────────────┐
//!                                           │ Fallback     │
//!                                           │ JSONL files  │
//!                                           └──────────────┘
//! ```

pub mod batcher;
pub mod config;
pub mod flusher;
pub mod line_reader;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod stats;
pub mod writer;

pub use batcher::{AddOutcome, Batcher};
pub use config::{ConfigValidationError, IngestConfig};
pub use flusher::{FlushError, FlushOutcome, FlushWorker, RetryPolicy};
pub use line_reader::{LineReader, LineReaderError, ReadOutcome};
pub use parser::{ParseOutcome, ParserError, RecordParser};
pub use pipeline::{
    ConnectionState, Pipeline, PipelineError, PipelineSettings, RunSummary, StopReason,
};
pub use record::{Batch, FieldValues, Record, TelemetryDocument};
pub use sink::{DocumentSink, FallbackStore, InMemorySink, MongoSink, SinkError};
pub use source::{PreparedSource, SerialSource, SourceError, StreamSource};
pub use stats::{PipelineStats, StatsSnapshot};
pub use writer::{Ack, SinkWriter};
