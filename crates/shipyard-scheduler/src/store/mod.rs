//! Ordered job storage.
//!
//! A [`JobStore`] holds the jobs of every stage queue and is the single point
//! of shared mutable state in the engine. Every operation is atomic: in
//! particular, [`JobStore::claim`] checks and takes a group's lease in one
//! step, so two concurrent claims can never both lease from the same group.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use shipyard_core::{ResourceId, Stage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

use crate::QueueResult;
use crate::job::{Job, JobId, JobState, Lease, QueueCounts, RetentionStats};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Name of this backend, for logs.
    fn name(&self) -> &'static str;

    /// Append a waiting job to the end of its group.
    async fn enqueue(
        &self,
        queue: Stage,
        group_id: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> QueueResult<JobId> {
        self.enqueue_for_run(queue, group_id, None, payload, max_attempts)
            .await
    }

    /// Like [`JobStore::enqueue`], tagging the job with the run it belongs to.
    async fn enqueue_for_run(
        &self,
        queue: Stage,
        group_id: &str,
        run_id: Option<ResourceId>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> QueueResult<JobId>;

    /// Lease the head job of any group in `queue` that has no leased job.
    ///
    /// Increments the job's `attempts`. Returns `None` when nothing is
    /// claimable.
    async fn claim(
        &self,
        queue: Stage,
        worker_id: &str,
        lease_timeout: Duration,
    ) -> QueueResult<Option<Job>>;

    /// Mark the leased job completed. Returns `false`, changing nothing, when
    /// the lease is no longer current (it expired and was reclaimed).
    async fn ack(&self, lease: &Lease) -> QueueResult<bool>;

    /// Fail the current attempt. The job goes back to waiting with its
    /// sequence key unchanged, or to failed when `permanent` or out of
    /// attempts. Returns the new state, or `None` when the lease is stale.
    async fn fail(
        &self,
        lease: &Lease,
        permanent: bool,
        reason: &str,
    ) -> QueueResult<Option<JobState>>;

    /// Reclaim every lease in `queue` past its expiry, returning the jobs as
    /// they are after the transition.
    async fn reclaim_expired(&self, queue: Stage) -> QueueResult<Vec<Job>>;

    /// Prune the oldest completed and failed jobs beyond the given counts.
    /// Waiting and leased jobs are never touched.
    async fn retention(
        &self,
        queue: Stage,
        keep_completed: usize,
        keep_failed: usize,
    ) -> QueueResult<RetentionStats>;

    /// Return jobs in `queue` leased by any of `worker_ids` to waiting,
    /// refunding the attempt. Used when shutdown abandons in-flight work.
    async fn release_leases(&self, queue: Stage, worker_ids: &[String]) -> QueueResult<u64>;

    /// Queues holding a waiting or leased job of `run_id`, in stage order.
    /// Empty once the run has ended.
    async fn run_queues(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>>;

    /// Mark a run cancelled, visible to every engine sharing this store.
    ///
    /// Returns the queues holding the run's waiting or leased jobs. Returns
    /// an empty list, changing nothing, when the run has ended or is already
    /// cancelled.
    async fn cancel_run(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>>;

    async fn is_run_cancelled(&self, run_id: ResourceId) -> QueueResult<bool>;

    /// Drop the cancellation marks of runs with no waiting or leased job left.
    async fn prune_cancelled_runs(&self) -> QueueResult<u64>;

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>>;

    /// Newest jobs first.
    async fn list(
        &self,
        queue: Stage,
        state: Option<JobState>,
        limit: usize,
    ) -> QueueResult<Vec<Job>>;

    async fn counts(&self, queue: Stage) -> QueueResult<QueueCounts>;

    /// Wait until `queue` may have claimable work, or `timeout` elapses.
    async fn wait_for_work(&self, queue: Stage, timeout: Duration);

    /// Release backend resources. Further calls fail.
    async fn close(&self);
}

/// Wakes idle workers of this process when a queue gains claimable work.
pub(crate) struct Wakers {
    notifies: HashMap<Stage, Notify>,
}

impl Wakers {
    pub(crate) fn new() -> Self {
        Self {
            notifies: Stage::ALL
                .into_iter()
                .map(|stage| (stage, Notify::new()))
                .collect(),
        }
    }

    pub(crate) fn wake(&self, queue: Stage) {
        if let Some(notify) = self.notifies.get(&queue) {
            notify.notify_one();
        }
    }

    pub(crate) async fn wait(&self, queue: Stage, timeout: Duration) {
        match self.notifies.get(&queue) {
            Some(notify) => {
                let _ = tokio::time::timeout(timeout, notify.notified()).await;
            }
            None => tokio::time::sleep(timeout).await,
        }
    }
}

pub(crate) fn validate_enqueue(group_id: &str, max_attempts: u32) -> QueueResult<()> {
    if group_id.is_empty() {
        return Err(shipyard_core::Error::InvalidInput("group id is required".to_string()).into());
    }
    if max_attempts == 0 {
        return Err(
            shipyard_core::Error::InvalidInput("max attempts must be at least 1".to_string())
                .into(),
        );
    }
    Ok(())
}
