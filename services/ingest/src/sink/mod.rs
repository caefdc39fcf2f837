//! Document store abstraction.
//!
//! # Delivery contract
//!
//! Sinks are at-least-once. A write that times out may still have been
//! applied, and the flush worker retries it; the store must tolerate
//! duplicate documents. A sink that can report a partial insert returns
//! [`SinkError::Partial`] with the indices it rejected so only those are
//! retried.

pub mod fallback;
pub mod memory;
pub mod mongo;

use crate::record::Batch;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use fallback::{FallbackError, FallbackStore};
pub use memory::InMemorySink;
pub use mongo::MongoSink;

/// Errors reported by a document sink.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink authentication failed: {0}")]
    Authentication(String),

    #[error("Sink rejected the write: {0}")]
    Rejected(String),

    #[error("{inserted} documents inserted, {} rejected: {message}", .failed_indices.len())]
    Partial {
        inserted: usize,
        failed_indices: Vec<usize>,
        message: String,
    },

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    /// Indices of the documents that were not stored, when the sink knows.
    pub fn failed_indices(&self) -> Option<&[usize]> {
        match self {
            SinkError::Partial { failed_indices, .. } => Some(failed_indices),
            _ => None,
        }
    }
}

/// Append-only document store with a liveness check and bulk insert.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Check the store is reachable and the credentials are accepted.
    async fn ping(&self) -> Result<(), SinkError>;

    /// Insert every record of the batch, returning how many were stored.
    async fn insert_many(&self, batch: &Batch) -> Result<usize, SinkError>;

    /// Release the connection. Called exactly once, at shutdown.
    async fn close(&self);

    /// Human-readable target for log lines, without credentials.
    fn describe(&self) -> String;
}
