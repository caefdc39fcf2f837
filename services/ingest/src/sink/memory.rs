//! In-memory document sink with scriptable failures.
//!
//! Stores documents in their JSON form, which makes it suitable for dry runs
//! and for exercising retry and shutdown behaviour without a database.

use super::{DocumentSink, SinkError};
use crate::record::{Batch, TelemetryDocument};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Scripted outcome for the next `insert_many` call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Fail the whole call.
    Error(SinkError),
    /// Store everything except these indices and report a partial insert.
    RejectIndices(Vec<usize>),
    /// Sleep before storing, to trip the writer's timeout.
    Stall(Duration),
}

#[derive(Default)]
pub struct InMemorySink {
    documents: Mutex<Vec<TelemetryDocument>>,
    insert_sizes: Mutex<Vec<usize>>,
    script: Mutex<VecDeque<ScriptedFailure>>,
    ping_error: Mutex<Option<SinkError>>,
    close_count: AtomicUsize,
    closed: AtomicBool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for a future insert; calls consume them in order.
    pub fn push_failure(&self, failure: ScriptedFailure) {
        self.script.lock().push_back(failure);
    }

    pub fn fail_ping(&self, error: SinkError) {
        *self.ping_error.lock() = Some(error);
    }

    /// Every document stored so far, in insertion order.
    pub fn documents(&self) -> Vec<TelemetryDocument> {
        self.documents.lock().clone()
    }

    /// Size of every insert call that stored something, in call order.
    pub fn insert_sizes(&self) -> Vec<usize> {
        self.insert_sizes.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn store(&self, documents: Vec<TelemetryDocument>) -> usize {
        let count = documents.len();
        self.documents.lock().extend(documents);
        self.insert_sizes.lock().push(count);
        count
    }
}

#[async_trait]
impl DocumentSink for InMemorySink {
    async fn ping(&self) -> Result<(), SinkError> {
        match self.ping_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn insert_many(&self, batch: &Batch) -> Result<usize, SinkError> {
        if self.is_closed() {
            return Err(SinkError::Unavailable("sink is closed".to_string()));
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            None => Ok(self.store(batch.documents())),
            Some(ScriptedFailure::Error(error)) => Err(error),
            Some(ScriptedFailure::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.store(batch.documents()))
            }
            Some(ScriptedFailure::RejectIndices(rejected)) => {
                let kept: Vec<TelemetryDocument> = batch
                    .documents()
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !rejected.contains(i))
                    .map(|(_, doc)| doc)
                    .collect();
                let inserted = self.store(kept);
                Err(SinkError::Partial {
                    inserted,
                    failed_indices: rejected,
                    message: "scripted rejection".to_string(),
                })
            }
        }
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
