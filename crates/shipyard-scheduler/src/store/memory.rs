//! In-process job store.

use async_trait::async_trait;
use chrono::Utc;
use shipyard_core::{ResourceId, Stage};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{JobStore, Wakers, validate_enqueue};
use crate::job::{Job, JobId, JobState, Lease, QueueCounts, RetentionStats};
use crate::lease;
use crate::{QueueError, QueueResult};

/// Unfinished jobs sharing a queue and group id.
#[derive(Default)]
struct Group {
    /// Waiting jobs by sequence key; the first entry is the group's head.
    waiting: BTreeMap<i64, JobId>,
    /// The one job of this group currently leased.
    leased: Option<JobId>,
}

impl Group {
    fn is_idle(&self) -> bool {
        self.leased.is_none() && self.waiting.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Only groups with a waiting or leased job; claims scan these.
    groups: HashMap<Stage, HashMap<String, Group>>,
    /// Last sequence key handed out per queue and group.
    sequences: HashMap<(Stage, String), i64>,
    /// Terminal jobs per queue and state, oldest first.
    finished: HashMap<(Stage, JobState), VecDeque<JobId>>,
    cancelled_runs: HashSet<ResourceId>,
    closed: bool,
}

impl Inner {
    fn group_mut(&mut self, queue: Stage, group_id: &str) -> &mut Group {
        self.groups
            .entry(queue)
            .or_default()
            .entry(group_id.to_string())
            .or_default()
    }

    fn drop_if_idle(&mut self, queue: Stage, group_id: &str) {
        if let Some(groups) = self.groups.get_mut(&queue) {
            if groups.get(group_id).is_some_and(Group::is_idle) {
                groups.remove(group_id);
            }
        }
    }

    fn run_queues(&self, run_id: ResourceId) -> Vec<Stage> {
        let queues: HashSet<Stage> = self
            .jobs
            .values()
            .filter(|job| job.run_id == Some(run_id) && !job.state.is_terminal())
            .map(|job| job.queue)
            .collect();
        let mut queues: Vec<Stage> = queues.into_iter().collect();
        queues.sort();
        queues
    }

    /// The job behind `lease`, if the lease is still the current one.
    fn current_lease(&self, lease: &Lease) -> Option<&Job> {
        self.jobs.get(&lease.job_id).filter(|job| {
            job.state == JobState::Leased
                && job.attempts == lease.attempt
                && job.leased_by.as_deref() == Some(lease.worker_id.as_str())
        })
    }

    /// Move a leased job to `next`, maintaining group and retention indexes.
    fn settle(&mut self, job_id: JobId, next: JobState, reason: Option<&str>) -> Option<Job> {
        let job = self.jobs.get_mut(&job_id)?;
        job.state = next;
        job.leased_by = None;
        job.lease_expires_at = None;
        if let Some(reason) = reason {
            job.last_error = Some(reason.to_string());
        }
        if next.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        let job = job.clone();

        let group = self.group_mut(job.queue, &job.group_id);
        if group.leased == Some(job_id) {
            group.leased = None;
        }
        if next == JobState::Waiting {
            group.waiting.insert(job.sequence_key, job_id);
        }
        self.drop_if_idle(job.queue, &job.group_id);
        if next.is_terminal() {
            self.finished
                .entry((job.queue, next))
                .or_default()
                .push_back(job_id);
        }
        Some(job)
    }

    fn leased_in(&self, queue: Stage) -> Vec<JobId> {
        self.groups
            .get(&queue)
            .map(|groups| groups.values().filter_map(|g| g.leased).collect())
            .unwrap_or_default()
    }
}

/// Job store held entirely in process memory.
///
/// All operations take one mutex, which makes each of them atomic with
/// respect to the others. Jobs are lost when the process exits.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    wakers: Wakers,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wakers: Wakers::new(),
        }
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| QueueError::StoreUnavailable("memory store lock poisoned".to_string()))?;
        if inner.closed {
            return Err(QueueError::StoreUnavailable(
                "memory store is closed".to_string(),
            ));
        }
        Ok(inner)
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue_for_run(
        &self,
        queue: Stage,
        group_id: &str,
        run_id: Option<ResourceId>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> QueueResult<JobId> {
        validate_enqueue(group_id, max_attempts)?;

        let id = {
            let mut inner = self.lock()?;
            let id = JobId::new();
            let last = inner
                .sequences
                .entry((queue, group_id.to_string()))
                .or_default();
            *last += 1;
            let sequence_key = *last;
            inner.group_mut(queue, group_id).waiting.insert(sequence_key, id);

            inner.jobs.insert(
                id,
                Job {
                    id,
                    queue,
                    group_id: group_id.to_string(),
                    sequence_key,
                    run_id,
                    payload,
                    attempts: 0,
                    max_attempts,
                    state: JobState::Waiting,
                    leased_by: None,
                    lease_expires_at: None,
                    last_error: None,
                    created_at: Utc::now(),
                    completed_at: None,
                },
            );
            id
        };

        self.wakers.wake(queue);
        Ok(id)
    }

    async fn claim(
        &self,
        queue: Stage,
        worker_id: &str,
        lease_timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        let mut inner = self.lock()?;

        // Heads of every group with nothing leased; the oldest head wins.
        let candidate = inner.groups.get(&queue).and_then(|groups| {
            groups
                .iter()
                .filter(|(_, group)| group.leased.is_none())
                .filter_map(|(group_id, group)| {
                    group
                        .waiting
                        .first_key_value()
                        .map(|(seq, id)| (*id, *seq, group_id.clone()))
                })
                .min_by_key(|(id, _, _)| *id)
        });

        let Some((job_id, sequence_key, group_id)) = candidate else {
            return Ok(None);
        };

        let group = inner.group_mut(queue, &group_id);
        group.waiting.remove(&sequence_key);
        group.leased = Some(job_id);

        let now = Utc::now();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.state = JobState::Leased;
        job.attempts += 1;
        job.leased_by = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease::expires_at(now, lease_timeout));

        debug!(job_id = %job_id, queue = %queue, group_id = %group_id, attempts = job.attempts, "Leased job");
        Ok(Some(job.clone()))
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let queue = {
            let mut inner = self.lock()?;
            let Some(queue) = inner.current_lease(lease).map(|job| job.queue) else {
                return Ok(false);
            };
            inner.settle(lease.job_id, JobState::Completed, None);
            queue
        };
        self.wakers.wake(queue);
        Ok(true)
    }

    async fn fail(
        &self,
        lease: &Lease,
        permanent: bool,
        reason: &str,
    ) -> QueueResult<Option<JobState>> {
        let (queue, next) = {
            let mut inner = self.lock()?;
            let Some(job) = inner.current_lease(lease) else {
                return Ok(None);
            };
            let queue = job.queue;
            let next = lease::state_after_failure(job.attempts, job.max_attempts, permanent);
            inner.settle(lease.job_id, next, Some(reason));
            (queue, next)
        };
        self.wakers.wake(queue);
        Ok(Some(next))
    }

    async fn reclaim_expired(&self, queue: Stage) -> QueueResult<Vec<Job>> {
        let reclaimed = {
            let mut inner = self.lock()?;
            let now = Utc::now();
            let expired: Vec<(JobId, JobState)> = inner
                .leased_in(queue)
                .into_iter()
                .filter_map(|id| inner.jobs.get(&id))
                .filter(|job| lease::is_expired(job, now))
                .map(|job| {
                    (
                        job.id,
                        lease::state_after_expiry(job.attempts, job.max_attempts),
                    )
                })
                .collect();

            expired
                .into_iter()
                .filter_map(|(id, next)| inner.settle(id, next, Some(lease::LEASE_EXPIRED)))
                .collect::<Vec<_>>()
        };

        if !reclaimed.is_empty() {
            self.wakers.wake(queue);
        }
        Ok(reclaimed)
    }

    async fn retention(
        &self,
        queue: Stage,
        keep_completed: usize,
        keep_failed: usize,
    ) -> QueueResult<RetentionStats> {
        let mut inner = self.lock()?;
        let mut stats = RetentionStats::default();

        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let pruned: Vec<JobId> = match inner.finished.get_mut(&(queue, state)) {
                Some(ids) if ids.len() > keep => {
                    let excess = ids.len() - keep;
                    ids.drain(..excess).collect()
                }
                _ => Vec::new(),
            };
            for id in &pruned {
                inner.jobs.remove(id);
            }
            match state {
                JobState::Completed => stats.completed_pruned = pruned.len() as u64,
                _ => stats.failed_pruned = pruned.len() as u64,
            }
        }

        Ok(stats)
    }

    async fn release_leases(&self, queue: Stage, worker_ids: &[String]) -> QueueResult<u64> {
        let released = {
            let mut inner = self.lock()?;
            let held: Vec<JobId> = inner
                .leased_in(queue)
                .into_iter()
                .filter(|id| {
                    inner
                        .jobs
                        .get(id)
                        .and_then(|job| job.leased_by.as_ref())
                        .is_some_and(|holder| worker_ids.contains(holder))
                })
                .collect();

            for id in &held {
                if let Some(job) = inner.jobs.get_mut(id) {
                    job.attempts = job.attempts.saturating_sub(1);
                }
                inner.settle(*id, JobState::Waiting, Some(lease::LEASE_RELEASED));
            }
            held.len() as u64
        };

        if released > 0 {
            self.wakers.wake(queue);
        }
        Ok(released)
    }

    async fn run_queues(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
        Ok(self.lock()?.run_queues(run_id))
    }

    async fn cancel_run(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
        let mut inner = self.lock()?;
        let queues = inner.run_queues(run_id);
        if queues.is_empty() || !inner.cancelled_runs.insert(run_id) {
            return Ok(Vec::new());
        }
        Ok(queues)
    }

    async fn is_run_cancelled(&self, run_id: ResourceId) -> QueueResult<bool> {
        Ok(self.lock()?.cancelled_runs.contains(&run_id))
    }

    async fn prune_cancelled_runs(&self) -> QueueResult<u64> {
        let mut inner = self.lock()?;
        let live: HashSet<ResourceId> = inner
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .filter_map(|job| job.run_id)
            .collect();
        let before = inner.cancelled_runs.len();
        inner.cancelled_runs.retain(|run_id| live.contains(run_id));
        Ok((before - inner.cancelled_runs.len()) as u64)
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn list(
        &self,
        queue: Stage,
        state: Option<JobState>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && state.is_none_or(|s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn counts(&self, queue: Stage) -> QueueResult<QueueCounts> {
        let inner = self.lock()?;
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values().filter(|job| job.queue == queue) {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn wait_for_work(&self, queue: Stage, timeout: Duration) {
        self.wakers.wait(queue, timeout).await;
    }

    async fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }
}
