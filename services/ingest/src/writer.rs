//! One bulk insert per call, bounded by an explicit timeout.

use crate::record::Batch;
use crate::sink::{DocumentSink, SinkError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Acknowledged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub inserted: usize,
}

/// Performs single write attempts. Retry and discard decisions belong to the
/// caller, which keeps ownership of the batch throughout.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn DocumentSink>,
    write_timeout: Duration,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn DocumentSink>, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id(), records = batch.len()))]
    pub async fn write(&self, batch: &Batch) -> Result<Ack, SinkError> {
        let inserted = tokio::time::timeout(self.write_timeout, self.sink.insert_many(batch))
            .await
            .map_err(|_| SinkError::Timeout(self.write_timeout))??;

        // A sink that stores fewer documents than it was given without
        // naming them is treated as a failure of the whole batch
        if inserted < batch.len() {
            return Err(SinkError::Rejected(format!(
                "sink acknowledged {} of {} documents",
                inserted,
                batch.len()
            )));
        }

        debug!(inserted, "Batch written");
        Ok(Ack { inserted })
    }
}
