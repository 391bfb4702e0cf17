//! Notification and status reporting contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PipelineStatus, ResourceId, Result, Stage};

/// Final outcome of a pipeline, delivered by the notify stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub pipeline_id: ResourceId,
    pub project_id: String,
    /// Either `Success` or `Failed`.
    pub status: PipelineStatus,
    /// The stage that produced the outcome.
    pub stage: Stage,
    pub details: Option<String>,
    pub deployment_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Delivers notifications (webhook, log, event bus).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// A status change for a pipeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub pipeline_id: ResourceId,
    pub status: PipelineStatus,
    pub stage: Stage,
    pub logs: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// A run accepted but not yet picked up by the git stage.
    pub fn pending(pipeline_id: ResourceId) -> Self {
        Self {
            pipeline_id,
            status: PipelineStatus::Pending,
            stage: Stage::Git,
            logs: None,
            completed_at: None,
        }
    }

    pub fn running(pipeline_id: ResourceId, stage: Stage) -> Self {
        Self {
            pipeline_id,
            status: PipelineStatus::Running,
            stage,
            logs: None,
            completed_at: None,
        }
    }

    pub fn finished(
        pipeline_id: ResourceId,
        status: PipelineStatus,
        stage: Stage,
        logs: String,
    ) -> Self {
        Self {
            pipeline_id,
            status,
            stage,
            logs: Some(logs),
            completed_at: Some(Utc::now()),
        }
    }
}

/// The only write path from the engine into external pipeline records.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, update: StatusUpdate) -> Result<()>;
}
