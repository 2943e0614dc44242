//! Source and sink abstractions.
//!
//! A flow's extract and load ends are trait objects so the engine never
//! depends on a concrete storage technology. Records cross the boundary as
//! JSON objects.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::config::{SinkConfig, SourceConfig};
use crate::db::DbPool;
use crate::error::Result;

pub type Record = serde_json::Value;

/// A finite, non-restartable stream of records, materialized in fixed-size
/// batches to bound memory. Batch boundaries are an implementation detail;
/// consumers see one flat sequence.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetch the next batch. An empty batch means the source is exhausted.
    async fn next_batch(&mut self) -> Result<Vec<Record>>;
}

/// Accepts one record at a time. Each write is an independent transaction;
/// any key-conflict policy (insert-always vs. skip) belongs to the caller,
/// not the sink.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&mut self, record: &Record) -> Result<()>;
}

pub fn open_source(pool: &DbPool, config: &SourceConfig) -> Result<Box<dyn Source>> {
    config.validate()?;
    match config {
        SourceConfig::Postgres(cfg) => Ok(Box::new(postgres::PostgresSource::new(
            pool.clone(),
            cfg.clone(),
        ))),
    }
}

pub fn open_sink(pool: &DbPool, config: &SinkConfig) -> Result<Box<dyn Sink>> {
    config.validate()?;
    match config {
        SinkConfig::Postgres(cfg) => Ok(Box::new(postgres::PostgresSink::new(
            pool.clone(),
            cfg.clone(),
        ))),
    }
}
