//! Submit a pipeline run to a durable store.

use anyhow::{Context, Result};
use shipyard_scheduler::{EngineContext, SubmitPipeline, enqueue_pipeline};

use super::{StoreOptions, open_store, require_durable};

pub async fn submit(options: &StoreOptions, request: SubmitPipeline) -> Result<()> {
    let config = options.load_config()?;
    require_durable(&config, "submit")?;
    let store = open_store(&config).await?;
    let ctx = EngineContext::new(config, store.clone());

    let project_id = request.project_id.clone();
    let submitted = enqueue_pipeline(&ctx, request)
        .await
        .with_context(|| format!("Failed to submit pipeline for {}", project_id))?;
    store.close().await;

    println!("Submitted pipeline {}", submitted.pipeline_id);
    println!("  project: {}", project_id);
    println!("  git job: {}", submitted.initial_job_id);
    Ok(())
}
