use std::env;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use dataflow_core::collision::WritePolicy;
use dataflow_core::db::{self, DbPool};
use dataflow_core::pipeline::FlowRegistry;
use dataflow_core::{flows, product_sync, scheduler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dataflow administrative tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run embedded database migrations
    Migrate,
    /// Seed demo products and register the example flow
    Seed,
    /// List persisted flow definitions
    List,
    /// Toggle a flow between active and inactive
    Toggle { name: String },
    /// Run a single flow now, outside the heartbeat cycle
    Run { name: String },
    /// Run one heartbeat tick locally
    Tick,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let database_url = env::var("DATABASE_URL")
        .or_else(|_| env::var("DATAFLOW_DATABASE_URL"))
        .context("set DATABASE_URL or DATAFLOW_DATABASE_URL")?;
    let pool = db::connect(&database_url).await?;

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            info!("migrations applied");
            Ok(())
        }
        Command::Seed => handle_seed(&pool).await,
        Command::List => handle_list(&pool).await,
        Command::Toggle { name } => {
            let status = flows::toggle_status(&pool, &name).await?;
            println!("{name} is now {}", status.as_str());
            Ok(())
        }
        Command::Run { name } => handle_run(&pool, &name).await,
        Command::Tick => handle_tick(&pool).await,
    }
}

fn build_registry(pool: &DbPool) -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.insert(
        product_sync::FLOW_NAME,
        product_sync::pipeline(pool, WritePolicy::SkipUnchanged),
    );
    registry
}

async fn handle_seed(pool: &DbPool) -> Result<()> {
    db::run_migrations(pool).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO products (name, sku, price, category, active) VALUES
            ('Garden Trowel', 'TRW-100', 19.99, 'Garden Tools', TRUE),
            ('Mystery Box', 'MYS-100', 5.00, NULL, TRUE),
            ('Free Sticker', 'STK-100', 0.00, 'Swag', TRUE),
            ('Retired Rake', 'RAK-100', 9.50, 'Garden Tools', FALSE)
        ON CONFLICT (sku) DO NOTHING
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();
    info!(inserted, "seeded demo products");

    let mut registry = FlowRegistry::new();
    let flow = product_sync::register(pool, &mut registry).await?;
    info!(flow = %flow.name, status = flow.status.as_str(), "registered flow");
    Ok(())
}

async fn handle_list(pool: &DbPool) -> Result<()> {
    let list = flows::list_flows(pool).await?;

    let mut table = Table::new();
    table.set_header(vec!["Name", "Status", "Interval (s)", "Last run", "Last error"]);
    for flow in list {
        let interval = flow
            .runtime_config()
            .map(|rt| rt.interval_secs().to_string())
            .unwrap_or_else(|_| "?".to_string());
        table.add_row(vec![
            flow.name.clone(),
            flow.status.as_str().to_string(),
            interval,
            flow.last_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            flow.last_error.unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_run(pool: &DbPool, name: &str) -> Result<()> {
    let registry = build_registry(pool);
    let report = scheduler::trigger_flow(pool, &registry, name).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_tick(pool: &DbPool) -> Result<()> {
    let registry = build_registry(pool);
    let summary = scheduler::run_tick(pool, &registry).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
