//! In-memory connectors for tests and dry runs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Record, Sink, Source};
use crate::error::{FlowError, Result};

/// Emits a fixed record set in batches of `batch_size`.
pub struct MemorySource {
    records: std::vec::IntoIter<Record>,
    batch_size: usize,
}

impl MemorySource {
    pub fn new(records: Vec<Record>, batch_size: usize) -> Self {
        Self {
            records: records.into_iter(),
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn next_batch(&mut self) -> Result<Vec<Record>> {
        Ok(self.records.by_ref().take(self.batch_size).collect())
    }
}

/// Collects written records; can be told to fail on the nth write to
/// exercise mid-run sink failures.
#[derive(Clone, Default)]
pub struct MemorySink {
    written: Arc<Mutex<Vec<Record>>>,
    attempts: usize,
    fail_on: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the write attempt with this zero-based index.
    pub fn failing_on(index: usize) -> Self {
        Self {
            fail_on: Some(index),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.written.lock().expect("sink mutex poisoned").clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let attempt = self.attempts;
        self.attempts += 1;
        if self.fail_on == Some(attempt) {
            return Err(FlowError::Sink(format!(
                "simulated write failure on record {attempt}"
            )));
        }
        self.written
            .lock()
            .expect("sink mutex poisoned")
            .push(record.clone());
        Ok(())
    }
}
