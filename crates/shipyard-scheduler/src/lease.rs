//! Lease timeout and retry policy.
//!
//! Every store backend applies the same rules:
//! - a claim increments `attempts` and sets `lease_expires_at = now + timeout`;
//! - a lease past its expiry is reclaimed exactly like a transient failure,
//!   so a handler that always hangs still runs into `max_attempts`;
//! - a failure is final when it is permanent or the attempt ceiling is reached.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::job::{Job, JobState};

/// Recorded as `last_error` on reclaimed jobs.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Recorded as `last_error` on jobs handed back during shutdown.
pub const LEASE_RELEASED: &str = "lease released on shutdown";

/// Upper bound on the part of a lease kept back from the handler.
const HANDLER_MARGIN_MAX: Duration = Duration::from_secs(1);

/// Time a handler may run under a lease of `lease_timeout`.
///
/// A twentieth of the lease, at most [`HANDLER_MARGIN_MAX`], is kept back so
/// the handler times out before the reaper can see its lease as expired.
pub fn handler_budget(lease_timeout: Duration) -> Duration {
    lease_timeout.saturating_sub((lease_timeout / 20).min(HANDLER_MARGIN_MAX))
}

/// Expiry for a lease taken at `now`.
pub fn expires_at(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_expired(job: &Job, now: DateTime<Utc>) -> bool {
    job.state == JobState::Leased && job.lease_expires_at.is_some_and(|at| at <= now)
}

/// State a leased job moves to when its current attempt fails.
pub fn state_after_failure(attempts: u32, max_attempts: u32, permanent: bool) -> JobState {
    if permanent || attempts >= max_attempts {
        JobState::Failed
    } else {
        JobState::Waiting
    }
}

/// State a leased job moves to when its lease expires.
pub fn state_after_expiry(attempts: u32, max_attempts: u32) -> JobState {
    state_after_failure(attempts, max_attempts, false)
}
