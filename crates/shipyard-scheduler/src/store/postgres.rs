//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers, in this process
//! or others, do not contend on the same row. Group exclusivity is enforced by
//! the claim statement itself and backed by the `stage_jobs_one_lease_per_group`
//! partial unique index: when two claims race for one group, the loser hits
//! the index and reports nothing claimable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::{ResourceId, Stage};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{debug, info};

use super::{JobStore, Wakers, validate_enqueue};
use crate::job::{Job, JobId, JobState, Lease, QueueCounts, RetentionStats};
use crate::lease;
use crate::{QueueError, QueueResult};

/// A job row as stored.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    group_id: String,
    sequence_key: i64,
    run_id: Option<uuid::Uuid>,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    state: String,
    leased_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> QueueResult<Self> {
        let queue: Stage = row.queue_name.parse().map_err(|_| {
            QueueError::StoreUnavailable(format!("unknown queue in store: {}", row.queue_name))
        })?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue,
            group_id: row.group_id,
            sequence_key: row.sequence_key,
            run_id: row.run_id.map(ResourceId::from_uuid),
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            state: row.state.parse()?,
            leased_by: row.leased_by,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

fn to_jobs(rows: Vec<JobRow>) -> QueueResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Parse queue names, in stage order.
fn to_stages(names: Vec<String>) -> QueueResult<Vec<Stage>> {
    let mut stages = names
        .iter()
        .map(|name| {
            name.parse::<Stage>().map_err(|_| {
                QueueError::StoreUnavailable(format!("unknown queue in store: {}", name))
            })
        })
        .collect::<QueueResult<Vec<_>>>()?;
    stages.sort();
    Ok(stages)
}

/// Job store backed by PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
    wakers: Wakers,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            wakers: Wakers::new(),
        }
    }

    /// Connect and apply the embedded migrations.
    pub async fn connect(database_url: &str) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Move a locked, leased row to `next` inside `tx`.
    async fn settle(
        tx: &mut sqlx::PgConnection,
        job_id: uuid::Uuid,
        next: JobState,
        attempts: i32,
        reason: &str,
    ) -> QueueResult<JobRow> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE stage_jobs
            SET state = $2,
                attempts = $3,
                completed_at = CASE WHEN $4 THEN NOW() ELSE NULL END,
                last_error = $5,
                leased_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(next.as_str())
        .bind(attempts)
        .bind(next.is_terminal())
        .bind(reason)
        .fetch_one(tx)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn name(&self) -> &'static str {
        "postgres"
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
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);

        let id: uuid::Uuid = sqlx::query_scalar(
            r#"
            WITH seq AS (
                INSERT INTO stage_group_sequences (queue_name, group_id, last_sequence)
                VALUES ($2, $3, 1)
                ON CONFLICT (queue_name, group_id)
                DO UPDATE SET last_sequence = stage_group_sequences.last_sequence + 1
                RETURNING last_sequence
            )
            INSERT INTO stage_jobs
                (id, queue_name, group_id, sequence_key, run_id, payload, attempts, max_attempts, state, created_at)
            SELECT $1, $2, $3, seq.last_sequence, $6, $4, 0, $5, 'waiting', NOW()
            FROM seq
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(queue.as_str())
        .bind(group_id)
        .bind(payload)
        .bind(max_attempts)
        .bind(run_id.map(|id| *id.as_uuid()))
        .fetch_one(&self.pool)
        .await?;

        self.wakers.wake(queue);
        Ok(JobId::from_uuid(id))
    }

    async fn claim(
        &self,
        queue: Stage,
        worker_id: &str,
        lease_timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        let timeout_ms = i64::try_from(lease_timeout.as_millis()).unwrap_or(i64::MAX);

        let result = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE stage_jobs
            SET state = 'leased',
                attempts = attempts + 1,
                leased_by = $2,
                lease_expires_at = NOW() + ($3::double precision * INTERVAL '1 millisecond')
            WHERE state = 'waiting' AND id = (
                SELECT j.id FROM stage_jobs j
                WHERE j.queue_name = $1
                  AND j.state = 'waiting'
                  AND NOT EXISTS (
                      SELECT 1 FROM stage_jobs h
                      WHERE h.queue_name = j.queue_name
                        AND h.group_id = j.group_id
                        AND (h.state = 'leased'
                             OR (h.state = 'waiting' AND h.sequence_key < j.sequence_key))
                  )
                ORDER BY j.created_at, j.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue.as_str())
        .bind(worker_id)
        .bind(timeout_ms)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Ok(Some(row.try_into()?)),
            Ok(None) => Ok(None),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                debug!(queue = %queue, worker_id, "Lost claim race for a group");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let queue: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE stage_jobs
            SET state = 'completed', completed_at = NOW(), leased_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND state = 'leased' AND attempts = $2 AND leased_by = $3
            RETURNING queue_name
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.attempt as i32)
        .bind(&lease.worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match queue.and_then(|q| q.parse::<Stage>().ok()) {
            Some(queue) => {
                self.wakers.wake(queue);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        lease: &Lease,
        permanent: bool,
        reason: &str,
    ) -> QueueResult<Option<JobState>> {
        let mut tx = self.pool.begin().await?;

        let held: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempts, max_attempts FROM stage_jobs
            WHERE id = $1 AND state = 'leased' AND attempts = $2 AND leased_by = $3
            FOR UPDATE
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.attempt as i32)
        .bind(&lease.worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = held else {
            return Ok(None);
        };

        let next = lease::state_after_failure(attempts as u32, max_attempts as u32, permanent);
        let row = Self::settle(&mut *tx, *lease.job_id.as_uuid(), next, attempts, reason).await?;
        tx.commit().await?;

        let job = Job::try_from(row)?;
        self.wakers.wake(job.queue);
        Ok(Some(next))
    }

    async fn reclaim_expired(&self, queue: Stage) -> QueueResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(uuid::Uuid, i32, i32)> = sqlx::query_as(
            r#"
            SELECT id, attempts, max_attempts FROM stage_jobs
            WHERE queue_name = $1 AND state = 'leased' AND lease_expires_at <= NOW()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (id, attempts, max_attempts) in expired {
            let next = lease::state_after_expiry(attempts as u32, max_attempts as u32);
            let row = Self::settle(&mut *tx, id, next, attempts, lease::LEASE_EXPIRED).await?;
            reclaimed.push(row);
        }
        tx.commit().await?;

        if !reclaimed.is_empty() {
            self.wakers.wake(queue);
        }
        to_jobs(reclaimed)
    }

    async fn retention(
        &self,
        queue: Stage,
        keep_completed: usize,
        keep_failed: usize,
    ) -> QueueResult<RetentionStats> {
        let mut stats = RetentionStats::default();

        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let pruned = sqlx::query(
                r#"
                DELETE FROM stage_jobs
                WHERE id IN (
                    SELECT id FROM stage_jobs
                    WHERE queue_name = $1 AND state = $2
                    ORDER BY completed_at DESC, id DESC
                    OFFSET $3
                )
                "#,
            )
            .bind(queue.as_str())
            .bind(state.as_str())
            .bind(i64::try_from(keep).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?
            .rows_affected();

            match state {
                JobState::Completed => stats.completed_pruned = pruned,
                _ => stats.failed_pruned = pruned,
            }
        }

        Ok(stats)
    }

    async fn release_leases(&self, queue: Stage, worker_ids: &[String]) -> QueueResult<u64> {
        let released = sqlx::query(
            r#"
            UPDATE stage_jobs
            SET state = 'waiting',
                attempts = GREATEST(attempts - 1, 0),
                leased_by = NULL,
                lease_expires_at = NULL,
                last_error = $3
            WHERE queue_name = $1 AND state = 'leased' AND leased_by = ANY($2)
            "#,
        )
        .bind(queue.as_str())
        .bind(worker_ids)
        .bind(lease::LEASE_RELEASED)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            self.wakers.wake(queue);
        }
        Ok(released)
    }

    async fn run_queues(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
        let queues: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT queue_name FROM stage_jobs
            WHERE run_id = $1 AND state IN ('waiting', 'leased')
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        to_stages(queues)
    }

    async fn cancel_run(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
        // The mark is only inserted while the run still has a live job.
        let queues: Vec<String> = sqlx::query_scalar(
            r#"
            WITH live AS (
                SELECT DISTINCT queue_name FROM stage_jobs
                WHERE run_id = $1 AND state IN ('waiting', 'leased')
            ), marked AS (
                INSERT INTO cancelled_runs (run_id)
                SELECT $1 WHERE EXISTS (SELECT 1 FROM live)
                ON CONFLICT (run_id) DO NOTHING
                RETURNING run_id
            )
            SELECT queue_name FROM live WHERE EXISTS (SELECT 1 FROM marked)
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        to_stages(queues)
    }

    async fn is_run_cancelled(&self, run_id: ResourceId) -> QueueResult<bool> {
        let cancelled: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM cancelled_runs WHERE run_id = $1)")
                .bind(run_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(cancelled)
    }

    async fn prune_cancelled_runs(&self) -> QueueResult<u64> {
        let pruned = sqlx::query(
            r#"
            DELETE FROM cancelled_runs c
            WHERE NOT EXISTS (
                SELECT 1 FROM stage_jobs j
                WHERE j.run_id = c.run_id AND j.state IN ('waiting', 'leased')
            )
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(pruned)
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM stage_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list(
        &self,
        queue: Stage,
        state: Option<JobState>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM stage_jobs
            WHERE queue_name = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(queue.as_str())
        .bind(state.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        to_jobs(rows)
    }

    async fn counts(&self, queue: Stage) -> QueueResult<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM stage_jobs WHERE queue_name = $1 GROUP BY state",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn wait_for_work(&self, queue: Stage, timeout: Duration) {
        self.wakers.wait(queue, timeout).await;
    }

    async fn close(&self) {
        info!("Closing job store connection pool");
        self.pool.close().await;
    }
}
