use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("invalid flow configuration: {0}")]
    Configuration(String),

    #[error("source failed: {0}")]
    Source(String),

    #[error("sink failed: {0}")]
    Sink(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no flow named '{0}'")]
    FlowNotFound(String),

    #[error("flow '{0}' is locked by another execution")]
    FlowBusy(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
