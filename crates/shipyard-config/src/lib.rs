//! KDL configuration parsing for Shipyard.
//!
//! This crate handles parsing of the engine configuration (`shipyard.kdl`):
//! - Per-queue concurrency, lease timeout, retry and retention settings
//! - Job store selection
//! - Collaborator endpoints (executor, notifications, status callbacks)

pub mod engine;
pub mod error;

pub use engine::{
    CollaboratorConfig, EngineConfig, QueueSettings, StoreConfig, load_engine_config,
    parse_engine_config,
};
pub use error::{ConfigError, ConfigResult};
