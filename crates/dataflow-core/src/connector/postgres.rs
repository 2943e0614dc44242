//! Postgres-backed source and sink.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use super::{Record, Sink, Source};
use crate::config::{ensure_identifier, PostgresSinkConfig, PostgresSourceConfig};
use crate::db::DbPool;
use crate::error::{FlowError, Result};

/// Reads one table as JSON objects with keyset pagination: rows are fetched
/// in `id` ascending order, `batch_size` at a time, so a run sees every
/// matching row exactly once even though it spans several queries.
pub struct PostgresSource {
    pool: DbPool,
    config: PostgresSourceConfig,
    last_id: i64,
    exhausted: bool,
}

impl PostgresSource {
    pub fn new(pool: DbPool, config: PostgresSourceConfig) -> Self {
        Self {
            pool,
            config,
            last_id: 0,
            exhausted: false,
        }
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn next_batch(&mut self) -> Result<Vec<Record>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let table = ensure_identifier(&self.config.table)?;
        let mut sql = format!(
            "SELECT to_jsonb(t.*) AS record FROM \"{table}\" t WHERE t.id > $1"
        );
        if let Some(scope) = &self.config.scope {
            let column = ensure_identifier(&scope.column)?;
            sql.push_str(&format!(" AND to_jsonb(t.\"{column}\") = $3"));
        }
        sql.push_str(" ORDER BY t.id LIMIT $2");

        let mut query = sqlx::query(&sql)
            .bind(self.last_id)
            .bind(self.config.batch_size as i64);
        if let Some(scope) = &self.config.scope {
            query = query.bind(scope.equals.clone());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| FlowError::Source(err.to_string()))?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let record: Value = row
                .try_get("record")
                .map_err(|err| FlowError::Source(err.to_string()))?;
            let id = record.get("id").and_then(Value::as_i64).ok_or_else(|| {
                FlowError::Source(format!(
                    "rows from '{table}' must expose an integer id ordering key"
                ))
            })?;
            self.last_id = id;
            batch.push(record);
        }

        if batch.len() < self.config.batch_size {
            self.exhausted = true;
        }

        Ok(batch)
    }
}

/// Inserts one JSON object per call into the configured table. The column
/// list comes from the object's keys, so fields absent from the record fall
/// back to the table's defaults (ids, timestamps).
pub struct PostgresSink {
    pool: DbPool,
    config: PostgresSinkConfig,
}

impl PostgresSink {
    pub fn new(pool: DbPool, config: PostgresSinkConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let table = ensure_identifier(&self.config.table)?;
        let object = record
            .as_object()
            .ok_or_else(|| FlowError::Sink("sink records must be JSON objects".to_string()))?;

        let mut columns: Vec<&str> = Vec::with_capacity(object.len());
        for key in object.keys() {
            columns.push(ensure_identifier(key)?);
        }
        columns.sort_unstable();

        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let sql = format!(
            "INSERT INTO \"{table}\" ({cols}) SELECT {pcols} FROM jsonb_populate_record(NULL::\"{table}\", $1) AS p",
            cols = quoted.join(", "),
            pcols = quoted
                .iter()
                .map(|c| format!("p.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        sqlx::query(&sql)
            .bind(record.clone())
            .execute(&self.pool)
            .await
            .map_err(|err| FlowError::Sink(err.to_string()))?;

        Ok(())
    }
}
