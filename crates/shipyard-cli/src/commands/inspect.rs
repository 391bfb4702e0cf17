//! Print queue counts and recent jobs.

use anyhow::{Context, Result};
use shipyard_core::Stage;
use shipyard_scheduler::{Job, JobState};

use super::{StoreOptions, open_store};

pub async fn inspect(
    options: &StoreOptions,
    queue: Option<&str>,
    state: Option<&str>,
    limit: usize,
) -> Result<()> {
    let stages = match queue {
        Some(name) => vec![name.parse::<Stage>()?],
        None => Stage::ALL.to_vec(),
    };
    let state = state
        .map(|s| s.parse::<JobState>())
        .transpose()
        .context("Unknown job state; expected waiting, leased, completed or failed")?;

    let config = options.load_config()?;
    let store = open_store(&config).await?;

    for stage in stages {
        let counts = store.counts(stage).await?;
        println!(
            "{:<7} waiting={} leased={} completed={} failed={}",
            stage, counts.waiting, counts.leased, counts.completed, counts.failed
        );

        for job in store.list(stage, state, limit).await? {
            println!("  {}", describe(&job));
        }
    }

    store.close().await;
    Ok(())
}

fn describe(job: &Job) -> String {
    let mut line = format!(
        "{} group={} seq={} state={} attempts={}/{}",
        job.id,
        job.group_id,
        job.sequence_key,
        job.state,
        job.attempts,
        job.max_attempts
    );
    if let Some(run_id) = &job.run_id {
        line.push_str(&format!(" run={}", run_id));
    }
    if let Some(worker) = &job.leased_by {
        line.push_str(&format!(" worker={}", worker));
    }
    if let Some(error) = &job.last_error {
        line.push_str(&format!(" error={:?}", error));
    }
    line
}
