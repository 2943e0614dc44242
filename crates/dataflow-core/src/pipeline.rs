//! Per-flow pipeline logic: a pure transform plus an optional collision
//! stage, composed at registration time rather than subclassed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::collision::CollisionStage;
use crate::connector::Record;
use crate::error::Result;

/// Maps one source record to one sink-shaped record. Implementations must
/// be pure: no clock, no I/O, identical output for identical input.
pub trait Transform: Send + Sync {
    fn apply(&self, record: &Record) -> Result<Record>;
}

impl<F> Transform for F
where
    F: Fn(&Record) -> Result<Record> + Send + Sync,
{
    fn apply(&self, record: &Record) -> Result<Record> {
        self(record)
    }
}

pub struct FlowPipeline {
    pub transform: Box<dyn Transform>,
    pub collision: Option<CollisionStage>,
}

impl FlowPipeline {
    pub fn new(transform: Box<dyn Transform>) -> Self {
        Self {
            transform,
            collision: None,
        }
    }

    pub fn with_collision(mut self, stage: CollisionStage) -> Self {
        self.collision = Some(stage);
        self
    }
}

/// Flow name -> pipeline logic, assembled once at startup. A persisted flow
/// whose name has no registered pipeline fails its runs with a
/// configuration error instead of being skipped silently.
#[derive(Default, Clone)]
pub struct FlowRegistry {
    pipelines: HashMap<String, Arc<FlowPipeline>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, pipeline: FlowPipeline) {
        self.pipelines.insert(name.into(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<FlowPipeline>> {
        self.pipelines.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }
}
