//! Runs one flow end-to-end and keeps its run bookkeeping.

use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, error, info};

use crate::collision::Classification;
use crate::connector::{self, Sink, Source};
use crate::db::DbPool;
use crate::error::{FlowError, Result};
use crate::flows::FlowDefinition;
use crate::pipeline::FlowPipeline;

/// Upper bound on the diagnostic stored in `last_error`.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub records_read: usize,
    pub records_written: usize,
    pub records_skipped: usize,
}

/// Execute one claimed flow. `claim` must be the connection holding the
/// flow's row lock; all bookkeeping writes go through it, while connector
/// traffic runs on the pool in its own transactions (partial output from a
/// failed run persists).
///
/// 1. stamp `last_run_at`
/// 2. parse configs, open source and sink
/// 3. stream: transform -> optional collision check -> policy-gated write
/// 4. clear `last_error` on success, record a bounded diagnostic on failure
pub async fn execute(
    pool: &DbPool,
    claim: &mut PgConnection,
    flow: &FlowDefinition,
    pipeline: Option<&FlowPipeline>,
) -> Result<RunReport> {
    sqlx::query("UPDATE data_flows SET last_run_at = now(), updated_at = now() WHERE id = $1")
        .bind(flow.id)
        .execute(&mut *claim)
        .await?;

    let result = run_flow(pool, flow, pipeline).await;

    match &result {
        Ok(report) => {
            sqlx::query("UPDATE data_flows SET last_error = NULL, updated_at = now() WHERE id = $1")
                .bind(flow.id)
                .execute(&mut *claim)
                .await?;
            info!(
                flow = %flow.name,
                read = report.records_read,
                written = report.records_written,
                skipped = report.records_skipped,
                "flow completed"
            );
        }
        Err(err) => {
            record_failure(claim, flow.id, err).await?;
            error!(flow = %flow.name, error = %err, "flow failed");
        }
    }

    result
}

/// Persist a failure diagnostic without touching `status`; a failed flow
/// stays eligible for its next due run.
pub(crate) async fn record_failure(
    claim: &mut PgConnection,
    flow_id: i64,
    err: &FlowError,
) -> Result<()> {
    sqlx::query("UPDATE data_flows SET last_error = $1, updated_at = now() WHERE id = $2")
        .bind(bounded_diagnostic(err))
        .bind(flow_id)
        .execute(claim)
        .await?;
    Ok(())
}

async fn run_flow(
    pool: &DbPool,
    flow: &FlowDefinition,
    pipeline: Option<&FlowPipeline>,
) -> Result<RunReport> {
    let pipeline = pipeline.ok_or_else(|| {
        FlowError::Configuration(format!("no pipeline registered for flow '{}'", flow.name))
    })?;

    let source_config = flow.source_config()?;
    let sink_config = flow.sink_config()?;
    let mut source = connector::open_source(pool, &source_config)?;
    let mut sink = connector::open_sink(pool, &sink_config)?;

    run_pipeline(source.as_mut(), sink.as_mut(), pipeline).await
}

/// The streaming core, independent of the flow store: source iteration,
/// transform, collision classification, write. All I/O for one flow is
/// sequential, record by record.
pub async fn run_pipeline(
    source: &mut dyn Source,
    sink: &mut dyn Sink,
    pipeline: &FlowPipeline,
) -> Result<RunReport> {
    let mut report = RunReport::default();

    loop {
        let batch = source.next_batch().await?;
        if batch.is_empty() {
            break;
        }

        for record in batch {
            report.records_read += 1;
            let transformed = pipeline.transform.apply(&record)?;

            if let Some(stage) = &pipeline.collision {
                let classification = stage.classify(&transformed).await?;
                match &classification {
                    Classification::Changed(diffs) => {
                        info!(changes = ?diffs, "record changed since previous output");
                    }
                    Classification::New => debug!("record has no previous output"),
                    Classification::Unchanged => debug!("record unchanged"),
                }
                if !stage.policy.should_write(&classification) {
                    report.records_skipped += 1;
                    continue;
                }
            }

            sink.write(&transformed).await?;
            report.records_written += 1;
        }
    }

    Ok(report)
}

fn bounded_diagnostic(err: &FlowError) -> String {
    let message = err.to_string();
    if message.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        message
    } else {
        message.chars().take(MAX_DIAGNOSTIC_CHARS).collect()
    }
}
