//! Postgres integration tests for claiming and execution. They run only
//! when DATAFLOW_TEST_DATABASE_URL points at a disposable database.

use std::env;

use anyhow::Result;
use serde_json::Value;
use tokio::runtime::Runtime;

use dataflow_core::collision::WritePolicy;
use dataflow_core::config::{
    PostgresSinkConfig, PostgresSourceConfig, RuntimeConfig, ScopeFilter, SinkConfig, SourceConfig,
};
use dataflow_core::db::{self, DbPool};
use dataflow_core::error::FlowError;
use dataflow_core::flows::{self, FlowStatus, NewFlow};
use dataflow_core::pipeline::FlowRegistry;
use dataflow_core::product_sync::{self, FLOW_NAME};
use dataflow_core::scheduler::{run_tick, trigger_flow};

fn test_database_url(test_name: &str) -> Option<String> {
    match env::var("DATAFLOW_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping {test_name} because DATAFLOW_TEST_DATABASE_URL is not set");
            None
        }
    }
}

async fn fresh_pool(database_url: &str) -> Result<DbPool> {
    let pool = db::connect(database_url).await?;
    db::run_migrations(&pool).await?;
    sqlx::query("TRUNCATE TABLE data_flows, product_exports, products CASCADE")
        .execute(&pool)
        .await?;
    Ok(pool)
}

async fn seed_products(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO products (name, sku, price, category, active) VALUES
            ('Trowel', 'TRW-1', 19.99, 'Garden Tools', TRUE),
            ('Mystery Box', 'MYS-1', 5.00, NULL, TRUE),
            ('Retired Rake', 'RAK-1', 9.50, 'Garden Tools', FALSE)
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn product_flow(interval_secs: u64, status: FlowStatus) -> NewFlow {
    NewFlow {
        name: FLOW_NAME.to_string(),
        source: SourceConfig::Postgres(PostgresSourceConfig {
            table: "products".to_string(),
            scope: Some(ScopeFilter {
                column: "active".to_string(),
                equals: Value::Bool(true),
            }),
            batch_size: 100,
        }),
        sink: SinkConfig::Postgres(PostgresSinkConfig {
            table: "product_exports".to_string(),
        }),
        runtime: RuntimeConfig::Heartbeat { interval_secs },
        status,
    }
}

fn product_registry(pool: &DbPool) -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.insert(
        FLOW_NAME,
        product_sync::pipeline(pool, WritePolicy::SkipUnchanged),
    );
    registry
}

async fn export_rows(pool: &DbPool) -> Result<Vec<(i64, String, i64, Option<String>)>> {
    let rows = sqlx::query_as(
        "SELECT product_id, sku, price_cents, category_slug FROM product_exports ORDER BY product_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[test]
fn heartbeat_executes_due_flows_end_to_end() -> Result<()> {
    let Some(url) = test_database_url("heartbeat_executes_due_flows_end_to_end") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;
        flows::find_or_create(&pool, &product_flow(3600, FlowStatus::Active)).await?;
        let registry = product_registry(&pool);

        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 1);
        assert_eq!(summary.flows_triggered, 1);

        let exports = export_rows(&pool).await?;
        assert_eq!(exports.len(), 2, "inactive product must not be exported");
        assert_eq!(exports[0].1, "TRW-1");
        assert_eq!(exports[0].2, 1999);
        assert_eq!(exports[0].3.as_deref(), Some("garden-tools"));
        assert_eq!(exports[1].1, "MYS-1");
        assert_eq!(exports[1].2, 500);
        assert_eq!(exports[1].3.as_deref(), Some("uncategorized"));

        let flow = flows::fetch_by_name(&pool, FLOW_NAME).await?;
        assert!(flow.last_run_at.is_some());
        assert!(flow.last_error.is_none());

        // The interval has not elapsed, so an immediate second tick finds
        // nothing due.
        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 0);
        assert_eq!(summary.flows_triggered, 0);

        Ok(())
    })
}

#[test]
fn inactive_flows_are_never_claimed() -> Result<()> {
    let Some(url) = test_database_url("inactive_flows_are_never_claimed") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;
        flows::find_or_create(&pool, &product_flow(0, FlowStatus::Inactive)).await?;
        let registry = product_registry(&pool);

        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 0);
        assert_eq!(summary.flows_triggered, 0);
        assert!(export_rows(&pool).await?.is_empty());

        let flow = flows::fetch_by_name(&pool, FLOW_NAME).await?;
        assert!(flow.last_run_at.is_none());

        Ok(())
    })
}

#[test]
fn concurrent_ticks_never_double_execute_a_flow() -> Result<()> {
    let Some(url) = test_database_url("concurrent_ticks_never_double_execute_a_flow") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;
        flows::find_or_create(&pool, &product_flow(3600, FlowStatus::Active)).await?;
        let registry = product_registry(&pool);

        // Two scheduler replicas ticking against the same database: a row
        // claimed by one is skip-locked (or no longer due) for the other.
        let (a, b) = tokio::join!(run_tick(&pool, &registry), run_tick(&pool, &registry));
        let triggered = a?.flows_triggered + b?.flows_triggered;
        assert_eq!(triggered, 1);

        assert_eq!(export_rows(&pool).await?.len(), 2, "no double execution");

        Ok(())
    })
}

#[test]
fn manual_trigger_reuses_the_executor_contract() -> Result<()> {
    let Some(url) = test_database_url("manual_trigger_reuses_the_executor_contract") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;
        // Manual runs bypass the due predicate: even an inactive flow can
        // be executed on demand.
        flows::find_or_create(&pool, &product_flow(3600, FlowStatus::Inactive)).await?;
        let registry = product_registry(&pool);

        let report = trigger_flow(&pool, &registry, FLOW_NAME).await?;
        assert_eq!(report.records_read, 2);
        assert_eq!(report.records_written, 2);

        let flow = flows::fetch_by_name(&pool, FLOW_NAME).await?;
        assert!(flow.last_run_at.is_some());
        assert!(flow.last_error.is_none());
        assert_eq!(flow.status, FlowStatus::Inactive, "status is untouched");

        // Unchanged products are classified no-op duplicates and skipped on
        // a re-run.
        let report = trigger_flow(&pool, &registry, FLOW_NAME).await?;
        assert_eq!(report.records_read, 2);
        assert_eq!(report.records_written, 0);
        assert_eq!(report.records_skipped, 2);
        assert_eq!(export_rows(&pool).await?.len(), 2);

        let missing = trigger_flow(&pool, &registry, "no_such_flow").await;
        assert!(matches!(missing, Err(FlowError::FlowNotFound(_))));

        Ok(())
    })
}

#[test]
fn failed_runs_record_a_diagnostic_and_stay_scheduled() -> Result<()> {
    let Some(url) = test_database_url("failed_runs_record_a_diagnostic_and_stay_scheduled") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        let mut broken = product_flow(3600, FlowStatus::Active);
        broken.source = SourceConfig::Postgres(PostgresSourceConfig {
            table: "missing_table".to_string(),
            scope: None,
            batch_size: 100,
        });
        flows::find_or_create(&pool, &broken).await?;
        let registry = product_registry(&pool);

        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 1);
        assert_eq!(
            summary.flows_triggered, 1,
            "a failed attempt still counts as triggered"
        );

        let flow = flows::fetch_by_name(&pool, FLOW_NAME).await?;
        assert!(flow.last_run_at.is_some());
        let diagnostic = flow.last_error.expect("failure must be recorded");
        assert!(!diagnostic.is_empty());
        assert_eq!(flow.status, FlowStatus::Active, "no auto-deactivation");

        // The failure does not make the flow due again before its interval.
        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 0);

        Ok(())
    })
}

#[test]
fn keyset_pagination_sees_each_row_exactly_once() -> Result<()> {
    let Some(url) = test_database_url("keyset_pagination_sees_each_row_exactly_once") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        // Four active products and one inactive. With batch_size 2 the
        // final batch is exactly full, so exhaustion takes one more empty
        // fetch; with batch_size 1 every batch spans a separate query.
        sqlx::query(
            r#"
            INSERT INTO products (name, sku, price, category, active) VALUES
                ('Alpha', 'KEY-1', 1.00, 'Tools', TRUE),
                ('Bravo', 'KEY-2', 2.00, 'Tools', TRUE),
                ('Charlie', 'KEY-3', 3.00, 'Tools', TRUE),
                ('Delta', 'KEY-4', 4.00, 'Tools', TRUE),
                ('Echo', 'KEY-5', 5.00, 'Tools', FALSE)
            "#,
        )
        .execute(&pool)
        .await?;

        for batch_size in [2usize, 1] {
            sqlx::query("TRUNCATE TABLE data_flows, product_exports CASCADE")
                .execute(&pool)
                .await?;

            let mut flow = product_flow(3600, FlowStatus::Active);
            flow.source = SourceConfig::Postgres(PostgresSourceConfig {
                table: "products".to_string(),
                scope: Some(ScopeFilter {
                    column: "active".to_string(),
                    equals: Value::Bool(true),
                }),
                batch_size,
            });
            flows::find_or_create(&pool, &flow).await?;
            let registry = product_registry(&pool);

            let report = trigger_flow(&pool, &registry, FLOW_NAME).await?;
            assert_eq!(report.records_read, 4, "batch_size {batch_size}");
            assert_eq!(report.records_written, 4, "batch_size {batch_size}");

            // No row skipped, none duplicated, order stable.
            let exports = export_rows(&pool).await?;
            let skus: Vec<&str> = exports.iter().map(|row| row.1.as_str()).collect();
            assert_eq!(
                skus,
                vec!["KEY-1", "KEY-2", "KEY-3", "KEY-4"],
                "batch_size {batch_size}"
            );
        }

        Ok(())
    })
}

#[test]
fn toggling_status_is_the_only_path_back_to_active() -> Result<()> {
    let Some(url) = test_database_url("toggling_status_is_the_only_path_back_to_active") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;
        flows::find_or_create(&pool, &product_flow(3600, FlowStatus::Inactive)).await?;
        let registry = product_registry(&pool);

        assert_eq!(run_tick(&pool, &registry).await?.flows_due, 0);

        let next = flows::toggle_status(&pool, FLOW_NAME).await?;
        assert_eq!(next, FlowStatus::Active);

        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_triggered, 1);

        assert_eq!(
            flows::toggle_status(&pool, FLOW_NAME).await?,
            FlowStatus::Inactive
        );

        Ok(())
    })
}

#[test]
fn unregistered_flows_fail_their_run_without_aborting_the_tick() -> Result<()> {
    let Some(url) = test_database_url("unregistered_flows_fail_their_run_without_aborting_the_tick")
    else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&url).await?;
        seed_products(&pool).await?;

        let mut orphan = product_flow(3600, FlowStatus::Active);
        orphan.name = "orphan_flow".to_string();
        flows::find_or_create(&pool, &orphan).await?;
        flows::find_or_create(&pool, &product_flow(3600, FlowStatus::Active)).await?;

        // Only the product flow has pipeline logic registered.
        let registry = product_registry(&pool);

        let summary = run_tick(&pool, &registry).await?;
        assert_eq!(summary.flows_due, 2);
        assert_eq!(summary.flows_triggered, 2);

        let orphan = flows::fetch_by_name(&pool, "orphan_flow").await?;
        assert!(orphan.last_error.unwrap().contains("no pipeline registered"));

        // The healthy flow still ran to completion in the same tick.
        let healthy = flows::fetch_by_name(&pool, FLOW_NAME).await?;
        assert!(healthy.last_error.is_none());
        assert_eq!(export_rows(&pool).await?.len(), 2);

        Ok(())
    })
}
