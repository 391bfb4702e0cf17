//! Engine configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use shipyard_core::Stage;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Settings for one stage queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum concurrent handler invocations.
    pub concurrency: usize,
    /// Lease timeout; also bounds a single handler invocation.
    pub job_timeout: Duration,
    /// Claims allowed before a job is marked failed.
    pub max_attempts: u32,
    /// Completed jobs retained for inspection.
    pub keep_completed: usize,
    /// Failed jobs retained for inspection.
    pub keep_failed: usize,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Upper bound on how long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// How often expired leases are reclaimed.
    pub reap_interval: Duration,
}

impl QueueSettings {
    /// Defaults for a stage. Builds are slow and heavy, notifications are
    /// quick and cheap.
    pub fn defaults_for(stage: Stage) -> Self {
        let (concurrency, timeout_ms, max_attempts, grace_ms) = match stage {
            Stage::Git => (4, 120_000, 3, 30_000),
            Stage::Build => (2, 600_000, 3, 120_000),
            Stage::Deploy => (2, 180_000, 3, 60_000),
            Stage::Notify => (8, 30_000, 5, 10_000),
        };
        Self {
            concurrency,
            job_timeout: Duration::from_millis(timeout_ms),
            max_attempts,
            keep_completed: 10,
            keep_failed: 20,
            shutdown_grace: Duration::from_millis(grace_ms),
            poll_interval: Duration::from_millis(1_000),
            reap_interval: Duration::from_millis(1_000),
        }
    }
}

/// Which job store backs the queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Process-local store; jobs do not survive a restart.
    Memory,
    Postgres { url: String },
}

/// Endpoints of the external collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Remote build executor.
    pub executor_url: Option<Url>,
    /// Webhook receiving final notifications.
    pub notify_webhook: Option<Url>,
    /// Callback receiving pipeline status updates.
    pub status_url: Option<Url>,
    /// Prefix for computed deployment URLs.
    pub deploy_base_url: Option<Url>,
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub collaborators: CollaboratorConfig,
    queues: BTreeMap<Stage, QueueSettings>,
}

impl EngineConfig {
    pub fn queue(&self, stage: Stage) -> &QueueSettings {
        // Every stage is populated at construction.
        &self.queues[&stage]
    }

    pub fn queue_mut(&mut self, stage: Stage) -> &mut QueueSettings {
        self.queues
            .entry(stage)
            .or_insert_with(|| QueueSettings::defaults_for(stage))
    }

    pub fn queues(&self) -> impl Iterator<Item = (Stage, &QueueSettings)> {
        self.queues.iter().map(|(stage, settings)| (*stage, settings))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            collaborators: CollaboratorConfig::default(),
            queues: Stage::ALL
                .into_iter()
                .map(|stage| (stage, QueueSettings::defaults_for(stage)))
                .collect(),
        }
    }
}

/// Read and parse an engine configuration file.
pub fn load_engine_config(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_engine_config(&text)
}

/// Parse an engine configuration from KDL text.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();
    let mut seen_queues = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "store" => {
                config.store = parse_store(node)?;
            }
            "executor" => {
                config.collaborators.executor_url = get_url_prop(node, "url")?;
            }
            "notify" => {
                config.collaborators.notify_webhook = get_url_prop(node, "webhook")?;
            }
            "status" => {
                config.collaborators.status_url = get_url_prop(node, "url")?;
            }
            "deploy" => {
                config.collaborators.deploy_base_url = get_url_prop(node, "base-url")?;
            }
            "queue" => {
                let stage = parse_queue(node, &mut config)?;
                if !seen_queues.insert(stage) {
                    return Err(ConfigError::Duplicate(format!("queue '{}'", stage)));
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    let backend = get_first_string_arg(node).unwrap_or_else(|| "memory".to_string());
    match backend.as_str() {
        "memory" => Ok(StoreConfig::Memory),
        "postgres" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField("store url".to_string()))?;
            Ok(StoreConfig::Postgres { url })
        }
        other => Err(ConfigError::InvalidValue {
            field: "store".to_string(),
            message: format!("unknown store backend: {}", other),
        }),
    }
}

fn parse_queue(node: &KdlNode, config: &mut EngineConfig) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("queue name".to_string()))?;
    let stage: Stage = name.parse().map_err(|_| ConfigError::InvalidValue {
        field: "queue".to_string(),
        message: format!("unknown queue: {}", name),
    })?;

    let settings = config.queue_mut(stage);

    if let Some(concurrency) = get_positive_prop(node, "concurrency")? {
        settings.concurrency = concurrency as usize;
    }
    if let Some(ms) = get_positive_prop(node, "timeout-ms")? {
        settings.job_timeout = Duration::from_millis(ms);
    }
    if let Some(attempts) = get_positive_prop(node, "max-attempts")? {
        settings.max_attempts = u32::try_from(attempts).map_err(|_| ConfigError::InvalidValue {
            field: "max-attempts".to_string(),
            message: format!("{} is too large", attempts),
        })?;
    }
    if let Some(keep) = get_count_prop(node, "keep-completed")? {
        settings.keep_completed = keep as usize;
    }
    if let Some(keep) = get_count_prop(node, "keep-failed")? {
        settings.keep_failed = keep as usize;
    }
    if let Some(ms) = get_count_prop(node, "grace-ms")? {
        settings.shutdown_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = get_positive_prop(node, "poll-ms")? {
        settings.poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = get_positive_prop(node, "reap-ms")? {
        settings.reap_interval = Duration::from_millis(ms);
    }

    Ok(stage)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_url_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Url>> {
    let Some(raw) = get_string_prop(node, name) else {
        return Ok(None);
    };
    Url::parse(&raw)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            field: name.to_string(),
            message: e.to_string(),
        })
}

/// A non-negative integer property.
fn get_count_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let n = value.as_integer().ok_or_else(|| ConfigError::InvalidValue {
        field: name.to_string(),
        message: "expected an integer".to_string(),
    })?;
    u64::try_from(n)
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("{} is out of range", n),
        })
}

/// A strictly positive integer property.
fn get_positive_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match get_count_prop(node, name)? {
        Some(0) => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}
