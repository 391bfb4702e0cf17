//! Stage payloads.
//!
//! Each stage's job payload embeds the same [`PipelineRef`], so the pipeline
//! identity survives every hand-off unchanged.

use serde::{Deserialize, Serialize};
use shipyard_core::executor::ArtifactRef;
use shipyard_core::{BuildVariant, PipelineStatus, ResourceId, Stage};

/// Identity and source of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub pipeline_id: ResourceId,
    /// Also the group id of every job of this run.
    pub project_id: String,
    pub repo_url: String,
    pub branch: String,
    pub variant: BuildVariant,
}

/// Input of the git stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPayload {
    #[serde(flatten)]
    pub pipeline: PipelineRef,
}

/// Input of the build stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPayload {
    #[serde(flatten)]
    pub pipeline: PipelineRef,
    /// The validated checkout.
    pub source: ArtifactRef,
    #[serde(default)]
    pub logs: String,
}

/// Input of the deploy stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPayload {
    #[serde(flatten)]
    pub pipeline: PipelineRef,
    /// Build output to publish.
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub logs: String,
}

/// Input of the notify stage: the pipeline's final outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    #[serde(flatten)]
    pub pipeline: PipelineRef,
    pub status: PipelineStatus,
    /// Stage that produced the outcome.
    pub stage: Stage,
    pub details: Option<String>,
    pub deployment_url: Option<String>,
    #[serde(default)]
    pub logs: String,
}

/// Append one stage's executor output to the accumulated pipeline log.
pub fn append_log(logs: &str, stage: Stage, output: &str) -> String {
    let mut combined = String::with_capacity(logs.len() + output.len() + 16);
    combined.push_str(logs);
    if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&format!("[{}]\n", stage));
    combined.push_str(output);
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pipeline() -> PipelineRef {
        PipelineRef {
            pipeline_id: ResourceId::new(),
            project_id: "proj-1".to_string(),
            repo_url: "https://example/repo".to_string(),
            branch: "main".to_string(),
            variant: BuildVariant::ViteApp,
        }
    }

    #[test]
    fn test_pipeline_fields_are_flattened() {
        let payload = DeployPayload {
            pipeline: pipeline(),
            artifact: ArtifactRef {
                name: "dist".to_string(),
                location: "s3://artifacts/dist.tar".to_string(),
                size: None,
                created_at: Utc::now(),
            },
            logs: String::new(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["project_id"], "proj-1");
        assert_eq!(json["variant"], "vite-app");
        assert_eq!(json["artifact"]["name"], "dist");

        let back: DeployPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.pipeline, payload.pipeline);
    }

    #[test]
    fn test_append_log_sections() {
        let logs = append_log("", Stage::Git, "cloned");
        let logs = append_log(&logs, Stage::Build, "built");
        assert_eq!(logs, "[git]\ncloned\n[build]\nbuilt");
    }
}
