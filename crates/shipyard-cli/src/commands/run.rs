//! Run the engine: one worker pool per stage until ctrl-c.

use anyhow::{Context, Result};
use shipyard_config::EngineConfig;
use shipyard_executor::{
    HttpExecutor, HttpStatusReporter, LogNotifier, LogStatusReporter, WebhookNotifier,
};
use shipyard_scheduler::{Collaborators, EngineContext, StageOrchestrator};
use std::sync::Arc;
use tracing::{info, warn};

use super::{StoreOptions, open_store};

pub async fn run(options: &StoreOptions) -> Result<()> {
    let config = options.load_config()?;
    let collaborators = collaborators(&config)?;
    let store = open_store(&config).await?;
    if store.name() == "memory" {
        warn!("Jobs in the in-memory store are lost on exit");
    }

    let ctx = EngineContext::new(config, store);
    info!(instance_id = %ctx.instance_id, "Starting Shipyard engine");

    let orchestrator = StageOrchestrator::new(ctx, collaborators);
    let coordinator = orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    for report in coordinator.shutdown().await {
        if report.finished_in_time {
            info!(stage = %report.stage, "Stage drained");
        } else {
            warn!(stage = %report.stage, released = report.released, "Stage drained after grace period");
        }
    }
    Ok(())
}

/// Build the collaborators named in the configuration. Notifications and
/// status updates fall back to the log when no endpoint is set.
fn collaborators(config: &EngineConfig) -> Result<Collaborators> {
    let endpoints = &config.collaborators;

    let executor_url = endpoints
        .executor_url
        .as_ref()
        .context("No build executor configured; add `executor url=\"...\"` to the config")?;
    let executor = HttpExecutor::new(executor_url)?;
    info!(endpoint = %executor.endpoint(), "Using remote build executor");

    let notifier: Arc<dyn shipyard_executor::Notifier> = match &endpoints.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    let status: Arc<dyn shipyard_executor::StatusReporter> = match &endpoints.status_url {
        Some(url) => Arc::new(HttpStatusReporter::new(url.clone())),
        None => Arc::new(LogStatusReporter),
    };

    Ok(Collaborators {
        executor: Arc::new(executor),
        notifier,
        status,
    })
}
