use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

pub type DbPool = Pool<Postgres>;

/// Connection pool for the engine. A tick holds one connection for its
/// claim transaction while connector traffic for the claimed flows runs on
/// further connections, so the pool must always be larger than the number
/// of concurrent ticks plus their busiest flow.
pub async fn connect(database_url: &str) -> Result<DbPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        // A stuck flow occupies its row lock for the life of the claim
        // transaction; idle sessions are closed so an abandoned claim
        // cannot starve later ticks indefinitely.
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
        .with_context(|| "failed to connect to Postgres")
}

/// Run database migrations embedded at compile-time.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .with_context(|| "failed to run database migrations")
}
