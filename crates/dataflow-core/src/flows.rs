//! Persisted flow definitions and their store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::config::{RuntimeConfig, SinkConfig, SourceConfig};
use crate::db::DbPool;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Inactive,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Active => "active",
            FlowStatus::Inactive => "inactive",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            FlowStatus::Active => FlowStatus::Inactive,
            FlowStatus::Inactive => FlowStatus::Active,
        }
    }
}

/// One row of `data_flows`. The config blobs stay as raw JSON here and are
/// parsed into their typed forms when a run opens them.
#[derive(Debug, Clone, Serialize)]
pub struct FlowDefinition {
    pub id: i64,
    pub name: String,
    pub source: Value,
    pub sink: Value,
    pub runtime: Value,
    pub status: FlowStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
    pub fn source_config(&self) -> Result<SourceConfig> {
        SourceConfig::from_value(&self.source)
    }

    pub fn sink_config(&self) -> Result<SinkConfig> {
        SinkConfig::from_value(&self.sink)
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        RuntimeConfig::from_value(&self.runtime)
    }
}

/// Registration payload for [`find_or_create`].
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub runtime: RuntimeConfig,
    pub status: FlowStatus,
}

const FLOW_COLUMNS: &str =
    "id, name, source, sink, runtime, status, last_run_at, last_error, created_at, updated_at";

pub(crate) fn flow_from_row(row: &PgRow) -> Result<FlowDefinition> {
    let status_str: String = row.try_get("status")?;
    let status = FlowStatus::from_str(&status_str).ok_or_else(|| {
        FlowError::Configuration(format!("invalid flow status '{status_str}'"))
    })?;

    Ok(FlowDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source: row.try_get("source")?,
        sink: row.try_get("sink")?,
        runtime: row.try_get("runtime")?,
        status,
        last_run_at: row.try_get("last_run_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Idempotent registration: inserts the definition if the name is new,
/// otherwise leaves the existing row (including its status and bookkeeping)
/// untouched. Returns the persisted row either way.
pub async fn find_or_create(pool: &DbPool, flow: &NewFlow) -> Result<FlowDefinition> {
    flow.source.validate()?;
    flow.sink.validate()?;

    sqlx::query(
        r#"
        INSERT INTO data_flows (name, source, sink, runtime, status)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(&flow.name)
    .bind(serde_json::to_value(&flow.source)?)
    .bind(serde_json::to_value(&flow.sink)?)
    .bind(serde_json::to_value(&flow.runtime)?)
    .bind(flow.status.as_str())
    .execute(pool)
    .await?;

    fetch_by_name(pool, &flow.name).await
}

pub async fn fetch_by_name(pool: &DbPool, name: &str) -> Result<FlowDefinition> {
    let row = sqlx::query(&format!(
        "SELECT {FLOW_COLUMNS} FROM data_flows WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => flow_from_row(&row),
        None => Err(FlowError::FlowNotFound(name.to_string())),
    }
}

pub async fn list_flows(pool: &DbPool) -> Result<Vec<FlowDefinition>> {
    let rows = sqlx::query(&format!(
        "SELECT {FLOW_COLUMNS} FROM data_flows ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(flow_from_row).collect()
}

/// Flip active/inactive. Reachable only through the administrative surface;
/// the scheduler never changes status on its own.
pub async fn toggle_status(pool: &DbPool, name: &str) -> Result<FlowStatus> {
    let current = fetch_by_name(pool, name).await?;
    let next = current.status.toggled();

    sqlx::query("UPDATE data_flows SET status = $1, updated_at = now() WHERE id = $2")
        .bind(next.as_str())
        .bind(current.id)
        .execute(pool)
        .await?;

    Ok(next)
}
