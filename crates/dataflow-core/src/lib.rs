pub mod error;
pub mod db;
pub mod config;
pub mod flows;
pub mod connector;
pub mod collision;
pub mod pipeline;
pub mod executor;
pub mod scheduler;
pub mod product_sync;
