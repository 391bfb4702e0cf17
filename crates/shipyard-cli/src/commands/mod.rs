//! CLI command implementations.

pub mod inspect;
pub mod run;
pub mod submit;

use anyhow::{Context, Result};
use shipyard_config::{EngineConfig, StoreConfig, load_engine_config};
use shipyard_scheduler::{JobStore, MemoryJobStore, PgJobStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Where the engine configuration and job store come from.
pub struct StoreOptions {
    pub config_path: String,
    pub database_url: Option<String>,
}

impl StoreOptions {
    /// Load the configuration, falling back to defaults when the file does
    /// not exist. `--database-url` replaces the configured store.
    pub fn load_config(&self) -> Result<EngineConfig> {
        let mut config = if Path::new(&self.config_path).exists() {
            load_engine_config(&self.config_path)
                .with_context(|| format!("Failed to load config: {}", self.config_path))?
        } else {
            warn!(path = %self.config_path, "Config file not found; using defaults");
            EngineConfig::default()
        };

        if let Some(url) = &self.database_url {
            config.store = StoreConfig::Postgres { url: url.clone() };
        }
        Ok(config)
    }
}

pub async fn open_store(config: &EngineConfig) -> Result<Arc<dyn JobStore>> {
    match &config.store {
        StoreConfig::Memory => {
            info!("Using in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        StoreConfig::Postgres { url } => {
            info!("Connecting to database...");
            let store = PgJobStore::connect(url)
                .await
                .context("Failed to open PostgreSQL job store")?;
            info!("Database migrations complete");
            Ok(Arc::new(store))
        }
    }
}

/// Require a durable store for commands that hand work to another process.
pub fn require_durable(config: &EngineConfig, command: &str) -> Result<()> {
    if matches!(config.store, StoreConfig::Memory) {
        anyhow::bail!(
            "`{}` needs a PostgreSQL store; set DATABASE_URL or add `store \"postgres\" url=...` to the config",
            command
        );
    }
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match load_engine_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            for (stage, queue) in config.queues() {
                println!(
                    "  {:<7} concurrency={} timeout={}ms max-attempts={} grace={}ms",
                    stage,
                    queue.concurrency,
                    queue.job_timeout.as_millis(),
                    queue.max_attempts,
                    queue.shutdown_grace.as_millis()
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
