//! Connector and runtime configuration blobs.
//!
//! At rest these live in JSONB columns on `data_flows`. In memory they are a
//! closed set of tagged variants, one strongly-typed struct per connector
//! kind, selected by the `kind` discriminator field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Postgres(PostgresSourceConfig),
}

/// Reads rows from one table as JSON objects, in stable `id` order, in
/// batches of `batch_size`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresSourceConfig {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeFilter>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Typed equality filter applied to the source query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeFilter {
    pub column: String,
    pub equals: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Postgres(PostgresSinkConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresSinkConfig {
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeConfig {
    Heartbeat {
        #[serde(default = "default_interval_secs")]
        interval_secs: u64,
    },
}

impl SourceConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        parse_config(value, "source")
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Postgres(cfg) => {
                ensure_identifier(&cfg.table)?;
                if let Some(scope) = &cfg.scope {
                    ensure_identifier(&scope.column)?;
                }
                if cfg.batch_size == 0 {
                    return Err(FlowError::Configuration(
                        "source batch_size must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl SinkConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        parse_config(value, "sink")
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SinkConfig::Postgres(cfg) => ensure_identifier(&cfg.table).map(|_| ()),
        }
    }
}

impl RuntimeConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        parse_config(value, "runtime")
    }

    pub fn interval_secs(&self) -> u64 {
        match self {
            RuntimeConfig::Heartbeat { interval_secs } => *interval_secs,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::Heartbeat {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|err| FlowError::Configuration(format!("malformed {what} config: {err}")))
}

/// Table and column names are interpolated into SQL, so they must be plain
/// identifiers: leading letter or underscore, then letters, digits or
/// underscores.
pub fn ensure_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(FlowError::Configuration(format!(
            "'{name}' is not a valid SQL identifier"
        )))
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}
