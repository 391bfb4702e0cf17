//! Job model.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shipyard_core::{ResourceId, Stage};

use crate::{QueueError, QueueResult};

pub type JobId = ResourceId;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[display("waiting")]
    Waiting,
    #[display("leased")]
    Leased,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "leased" => Ok(JobState::Leased),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::StoreUnavailable(format!(
                "unknown job state in store: {}",
                other
            ))),
        }
    }
}

/// A queued unit of stage work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: Stage,
    /// Ordering key; jobs sharing it in one queue run one at a time.
    pub group_id: String,
    /// Position within the group, strictly increasing per (queue, group).
    pub sequence_key: i64,
    /// Pipeline run this job belongs to, if any.
    #[serde(default)]
    pub run_id: Option<ResourceId>,
    pub payload: serde_json::Value,
    /// Number of times this job has been leased.
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    /// Worker holding the lease, while leased.
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The lease currently held on this job, if any.
    pub fn lease(&self) -> Option<Lease> {
        match (self.state, &self.leased_by) {
            (JobState::Leased, Some(worker_id)) => Some(Lease {
                job_id: self.id,
                attempt: self.attempts,
                worker_id: worker_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Proof of an exclusive claim on a job.
///
/// The attempt number identifies the lease: once a lease has been reclaimed
/// and the job leased again, acks and fails carrying the old attempt are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub attempt: u32,
    pub worker_id: String,
}

/// Number of jobs in each state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Leased => self.leased += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }
}

/// Jobs removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub completed_pruned: u64,
    pub failed_pruned: u64,
}

impl RetentionStats {
    pub fn total(&self) -> u64 {
        self.completed_pruned + self.failed_pruned
    }
}
