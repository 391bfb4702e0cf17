//! Build executor contract.
//!
//! The executor clones repositories, runs builds in isolated environments and
//! publishes artifacts. The pipeline engine treats it as a black box with a
//! single operation, [`BuildExecutor::execute`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ResourceId, Result};

/// A request to run one stage's external work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    /// Pipeline this work belongs to.
    pub pipeline_id: ResourceId,
    /// What to do.
    pub kind: StageKind,
    /// Repository URL.
    pub repo_url: String,
    /// Branch to check out.
    pub branch: String,
    /// Free-form extra parameters forwarded to the executor.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// The work an executor is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    /// Check the repository is reachable and has the expected layout.
    Validate { required_files: Vec<String> },
    /// Run a build plan and collect its output directory.
    Build { plan: BuildPlan },
    /// Publish a previously built artifact.
    Deploy { artifact: ArtifactRef },
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Validate { .. } => "validate",
            StageKind::Build { .. } => "build",
            StageKind::Deploy { .. } => "deploy",
        }
    }
}

/// Container plan for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Container image to run.
    pub image: String,
    /// Where the repository is mounted inside the container.
    pub workdir: String,
    /// Commands run in order; each is an argv vector.
    pub commands: Vec<Vec<String>>,
    /// Output directory, relative to `workdir`.
    pub output_dir: String,
}

/// Reference to something an executor produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    /// Backend-specific location (path, object key, URL).
    pub location: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Successful result of [`BuildExecutor::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub artifact: ArtifactRef,
    pub log: String,
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run one stage's work. Errors for which [`crate::Error::is_permanent`]
    /// holds are not retried.
    async fn execute(&self, request: StageRequest) -> Result<StageOutput>;
}
