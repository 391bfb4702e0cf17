//! Collaborators that only write to the log. Used when no endpoint is
//! configured.

use async_trait::async_trait;
use shipyard_core::notify::{Notification, Notifier, StatusReporter, StatusUpdate};
use shipyard_core::{PipelineStatus, Result};
use tracing::{info, warn};

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.status {
            PipelineStatus::Failed => warn!(
                pipeline_id = %notification.pipeline_id,
                project_id = %notification.project_id,
                stage = %notification.stage,
                details = notification.details.as_deref().unwrap_or_default(),
                "Pipeline failed"
            ),
            status => info!(
                pipeline_id = %notification.pipeline_id,
                project_id = %notification.project_id,
                stage = %notification.stage,
                %status,
                deployment_url = notification.deployment_url.as_deref().unwrap_or_default(),
                "Pipeline finished"
            ),
        }
        Ok(())
    }
}

pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(&self, update: StatusUpdate) -> Result<()> {
        info!(
            pipeline_id = %update.pipeline_id,
            status = %update.status,
            stage = %update.stage,
            "Pipeline status"
        );
        Ok(())
    }
}
