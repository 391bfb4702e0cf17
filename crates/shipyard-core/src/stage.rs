//! Pipeline stages and run statuses.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A pipeline stage. Each stage owns exactly one queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[display("git")]
    Git,
    #[display("build")]
    Build,
    #[display("deploy")]
    Deploy,
    #[display("notify")]
    Notify,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Git, Stage::Build, Stage::Deploy, Stage::Notify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Git => "git",
            Stage::Build => "build",
            Stage::Deploy => "deploy",
            Stage::Notify => "notify",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Stage::Git),
            "build" => Ok(Stage::Build),
            "deploy" => Ok(Stage::Deploy),
            "notify" => Ok(Stage::Notify),
            other => Err(Error::InvalidInput(format!("unknown stage: {}", other))),
        }
    }
}

/// Externally visible status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Success | PipelineStatus::Failed)
    }
}
