use std::sync::Arc;

use dataflow_core::db::{self, DbPool};
use dataflow_core::pipeline::FlowRegistry;
use dataflow_core::product_sync;
use tracing::info;

use crate::auth::HeartbeatConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub registry: Arc<FlowRegistry>,
    pub heartbeat: Arc<HeartbeatConfig>,
}

impl AppState {
    /// Connect, migrate, and perform idempotent flow registration so every
    /// persisted flow the service knows about has pipeline logic installed
    /// before the first tick.
    pub async fn new(database_url: &str, heartbeat: HeartbeatConfig) -> anyhow::Result<Self> {
        let pool = db::connect(database_url).await?;
        db::run_migrations(&pool).await?;

        let mut registry = FlowRegistry::new();
        let flow = product_sync::register(&pool, &mut registry).await?;
        info!(flow = %flow.name, status = flow.status.as_str(), "registered flow");

        Ok(Self {
            pool,
            registry: Arc::new(registry),
            heartbeat: Arc::new(heartbeat),
        })
    }
}
