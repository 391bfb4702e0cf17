//! Worker pools that process jobs from a stage queue.

use async_trait::async_trait;
use futures::FutureExt;
use shipyard_config::QueueSettings;
use shipyard_core::Stage;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::context::EngineContext;
use crate::job::{Job, JobState};
use crate::lease;
use crate::shutdown::DrainReport;
use crate::store::JobStore;
use crate::{QueueResult, StageError};

/// Backoff after the store fails a claim.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Retention runs once per this many reap ticks.
const RETENTION_EVERY_TICKS: u32 = 30;

/// The work done for one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Process a leased job. A permanent error fails the job immediately; a
    /// transient one returns it to the queue until its attempts run out.
    async fn handle(&self, job: &Job) -> Result<(), StageError>;

    /// Called once when a job has failed for good, either through a handler
    /// error or because its lease kept expiring.
    async fn on_failed(&self, _job: &Job, _reason: &str) {}
}

/// A bounded set of workers for one queue.
pub struct WorkerPool {
    stage: Stage,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn StageHandler>,
    instance_id: String,
    shutdown: CancellationToken,
    slots: JoinSet<()>,
    reaper: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: &EngineContext, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            stage,
            settings: ctx.config.queue(stage).clone(),
            store: ctx.store.clone(),
            handler,
            instance_id: ctx.instance_id.clone(),
            shutdown: ctx.shutdown.child_token(),
            slots: JoinSet::new(),
            reaper: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Identifiers the workers of this pool claim under.
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.settings.concurrency)
            .map(|slot| format!("{}-{}-{}", self.instance_id, self.stage, slot))
            .collect()
    }

    /// Spawn the workers and the lease reaper.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        info!(
            stage = %self.stage,
            concurrency = self.settings.concurrency,
            job_timeout_ms = self.settings.job_timeout.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "Starting worker pool"
        );

        for worker_id in self.worker_ids() {
            let worker = Worker {
                id: worker_id,
                stage: self.stage,
                settings: self.settings.clone(),
                store: self.store.clone(),
                handler: self.handler.clone(),
                shutdown: self.shutdown.clone(),
            };
            self.slots.spawn(worker.run());
        }

        let reaper = Reaper {
            stage: self.stage,
            settings: self.settings.clone(),
            store: self.store.clone(),
            handler: self.handler.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.reaper = Some(tokio::spawn(reaper.run()));
    }

    /// Stop claiming, wait up to `grace` for in-flight jobs, then abort what
    /// is left and hand its leases back to the queue.
    pub async fn drain(&mut self, grace: Duration) -> QueueResult<DrainReport> {
        info!(stage = %self.stage, grace_ms = grace.as_millis() as u64, "Draining worker pool");
        self.shutdown.cancel();

        let slots = &mut self.slots;
        let finished_in_time = tokio::time::timeout(grace, async {
            while slots.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let mut released = 0;
        if !finished_in_time {
            self.slots.abort_all();
            while self.slots.join_next().await.is_some() {}
            released = self
                .store
                .release_leases(self.stage, &self.worker_ids())
                .await?;
            warn!(stage = %self.stage, released, "Grace period elapsed; released in-flight jobs");
        }

        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }

        info!(stage = %self.stage, finished_in_time, "Worker pool drained");
        Ok(DrainReport {
            stage: self.stage,
            finished_in_time,
            released,
        })
    }
}

/// One worker: claims a job, runs the handler, records the outcome.
struct Worker {
    id: String,
    stage: Stage,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn StageHandler>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, stage = %self.stage, "Starting worker");

        while !self.shutdown.is_cancelled() {
            match self
                .store
                .claim(self.stage, &self.id, self.settings.job_timeout)
                .await
            {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    trace!(worker_id = %self.id, "No claimable job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.store.wait_for_work(self.stage, self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(worker_id = %self.id, stage = %self.stage, "Worker stopped");
    }

    async fn process(&self, job: Job) {
        let Some(lease) = job.lease() else {
            warn!(job_id = %job.id, "Claimed job carries no lease");
            return;
        };

        info!(
            job_id = %job.id,
            stage = %self.stage,
            group_id = %job.group_id,
            attempts = job.attempts,
            worker_id = %self.id,
            "Reserved job"
        );

        let budget = lease::handler_budget(self.settings.job_timeout);
        let invocation = AssertUnwindSafe(self.handler.handle(&job)).catch_unwind();
        let outcome = match tokio::time::timeout(budget, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StageError::transient("stage handler panicked")),
            Err(_) => Err(StageError::transient(format!(
                "stage handler exceeded {}ms",
                budget.as_millis()
            ))),
        };

        match outcome {
            Ok(()) => match self.store.ack(&lease).await {
                Ok(true) => info!(job_id = %job.id, stage = %self.stage, "Completed job"),
                Ok(false) => warn!(job_id = %job.id, "Lease was reclaimed before completion"),
                Err(e) => error!(
                    job_id = %job.id,
                    error = %e,
                    "Failed to acknowledge job; it will be redelivered when the lease expires"
                ),
            },
            Err(err) => {
                match self
                    .store
                    .fail(&lease, err.is_permanent(), &err.message)
                    .await
                {
                    Ok(Some(JobState::Failed)) => {
                        error!(
                            job_id = %job.id,
                            stage = %self.stage,
                            group_id = %job.group_id,
                            attempts = job.attempts,
                            error = %err,
                            "Job failed"
                        );
                        self.handler.on_failed(&job, &err.message).await;
                    }
                    Ok(Some(_)) => warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        max_attempts = job.max_attempts,
                        error = %err,
                        "Job attempt failed; will retry"
                    ),
                    Ok(None) => warn!(job_id = %job.id, "Lease was reclaimed before failure"),
                    Err(e) => error!(
                        job_id = %job.id,
                        error = %e,
                        "Failed to record job failure; it will be redelivered when the lease expires"
                    ),
                }
            }
        }
    }
}

/// Periodically reclaims expired leases and prunes finished jobs.
struct Reaper {
    stage: Stage,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn StageHandler>,
    shutdown: CancellationToken,
}

impl Reaper {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.settings.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.reclaim().await;

            ticks = ticks.wrapping_add(1);
            if ticks % RETENTION_EVERY_TICKS == 0 {
                self.prune().await;
            }
        }
    }

    async fn reclaim(&self) {
        let reclaimed = match self.store.reclaim_expired(self.stage).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Failed to reclaim expired leases");
                return;
            }
        };

        for job in reclaimed {
            if job.state == JobState::Failed {
                error!(
                    job_id = %job.id,
                    stage = %self.stage,
                    attempts = job.attempts,
                    "Lease expired on final attempt; job failed"
                );
                self.handler.on_failed(&job, lease::LEASE_EXPIRED).await;
            } else {
                warn!(
                    job_id = %job.id,
                    stage = %self.stage,
                    attempts = job.attempts,
                    "Lease expired; job returned to queue"
                );
            }
        }
    }

    async fn prune(&self) {
        match self
            .store
            .retention(
                self.stage,
                self.settings.keep_completed,
                self.settings.keep_failed,
            )
            .await
        {
            Ok(stats) if stats.total() > 0 => debug!(
                stage = %self.stage,
                completed = stats.completed_pruned,
                failed = stats.failed_pruned,
                "Pruned finished jobs"
            ),
            Ok(_) => {}
            Err(e) => warn!(stage = %self.stage, error = %e, "Failed to prune finished jobs"),
        }

        match self.store.prune_cancelled_runs().await {
            Ok(0) => {}
            Ok(pruned) => debug!(stage = %self.stage, pruned, "Pruned cancellation marks"),
            Err(e) => warn!(stage = %self.stage, error = %e, "Failed to prune cancellation marks"),
        }
    }
}
