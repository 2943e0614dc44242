//! Collision detection: classify a transformed record against the prior
//! output for the same business key.
//!
//! Classification never writes or suppresses anything by itself; the
//! executor consumes it under the pipeline's [`WritePolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connector::Record;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// No prior output for this business key.
    New,
    /// Prior output exists and every mapped field matches.
    Unchanged,
    /// Prior output exists and at least one mapped field differs.
    Changed(Vec<FieldDiff>),
}

/// Whether collision detection gates the write. Historic variants of this
/// stage disagreed (log-only vs. skip-on-no-change), so the choice is an
/// explicit per-pipeline flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Write every record; the classification is only logged.
    Always,
    /// Suppress writes classified [`Classification::Unchanged`].
    SkipUnchanged,
}

impl WritePolicy {
    pub fn should_write(&self, classification: &Classification) -> bool {
        match self {
            WritePolicy::Always => true,
            WritePolicy::SkipUnchanged => {
                !matches!(classification, Classification::Unchanged)
            }
        }
    }
}

/// Looks up prior output by business key (never by storage id) and names
/// the fields that participate in change detection.
#[async_trait]
pub trait CollisionDetector: Send + Sync {
    async fn find_previous(&self, record: &Record) -> Result<Option<Record>>;

    fn mapped_fields(&self) -> &[&'static str];
}

pub struct CollisionStage {
    pub detector: Box<dyn CollisionDetector>,
    pub policy: WritePolicy,
}

impl CollisionStage {
    pub async fn classify(&self, record: &Record) -> Result<Classification> {
        match self.detector.find_previous(record).await? {
            None => Ok(Classification::New),
            Some(previous) => Ok(diff_records(
                &previous,
                record,
                self.detector.mapped_fields(),
            )),
        }
    }
}

/// Field-level diff across the mapped attributes. Missing fields compare as
/// JSON null on either side.
pub fn diff_records(previous: &Record, next: &Record, fields: &[&str]) -> Classification {
    let mut diffs = Vec::new();
    for field in fields {
        let before = previous.get(*field).cloned().unwrap_or(Value::Null);
        let after = next.get(*field).cloned().unwrap_or(Value::Null);
        if before != after {
            diffs.push(FieldDiff {
                field: (*field).to_string(),
                before,
                after,
            });
        }
    }

    if diffs.is_empty() {
        Classification::Unchanged
    } else {
        Classification::Changed(diffs)
    }
}
