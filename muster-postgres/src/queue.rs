use crate::types::{JobRow, ReapedRow};
use anyhow::Context;
use async_trait::async_trait;
use muster::core::job::{Job, NewJob};
use muster::core::queue::{ClaimFilter, Queue, QueueError, QueueStats, ReapedJob};
use muster::core::retry::FailureDecision;
use muster::core::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;

const LEASE_EXPIRED: &str = "lease expired";

/// An implementation of the Queue backed by PostgreSQL.
///
/// Claims lock the selected row with `FOR UPDATE SKIP LOCKED`, so concurrent
/// workers never wait on each other's claims.
#[derive(Clone)]
pub struct PgQueue {
    pub(crate) pool: PgPool,
}

impl PgQueue {
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, QueueError> {
    i32::try_from(value).map_err(|_| QueueError::InvalidJob(format!("{field} is out of range")))
}

fn held(job_id: Uuid, attempts: u32, rows_affected: u64) -> Result<(), QueueError> {
    if rows_affected == 0 {
        return Err(QueueError::lease_lost(job_id, attempts));
    }
    Ok(())
}

#[async_trait]
impl Queue for PgQueue {
    #[instrument(skip_all, err, ret, fields(job_type = %job.job_type, priority = job.priority))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        job.validate()?;
        let max_attempts = to_i32(job.max_attempts, "max_attempts")?;

        sqlx::query(
            "INSERT INTO muster_jobs (id, job_type, payload, priority, scheduled_at, max_attempts, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(max_attempts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to add job to the queue")?;

        Ok(job.id)
    }

    #[instrument(skip_all, err, fields(type_prefix = %filter.type_prefix()))]
    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        now: DateTime,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id FROM muster_jobs WHERE status = 'queued' AND scheduled_at <= ");
        builder.push_bind(now);
        builder.push(" AND job_type LIKE ");
        builder.push_bind(filter.like_pattern());
        builder.push(" ESCAPE '\\'");
        if !filter.job_types().is_empty() {
            builder.push(" AND job_type IN (");
            {
                let mut separated = builder.separated(",");
                for job_type in filter.job_types() {
                    separated.push_bind(job_type.as_str());
                }
            }
            builder.push(")");
        }
        builder.push(" ORDER BY priority ASC, scheduled_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED");

        let id: Option<Uuid> = builder
            .build_query_scalar()
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to select the next job")?;

        let Some(id) = id else {
            tx.commit().await.context("Failed to commit transaction")?;
            return Ok(None);
        };

        let row = sqlx::query(
            "UPDATE muster_jobs
             SET status = 'running', started_at = $2, attempts = attempts + 1, lease_expires_at = $3
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(now)
        .bind(now + lease)
        .try_map(|row| JobRow::from_row(&row))
        .fetch_one(&mut *tx)
        .await
        .context("Failed to check out a job from the queue")?;

        tx.commit().await.context("Failed to commit transaction")?;

        Job::try_from(row).map(Some)
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, attempts = attempts))]
    async fn mark_done(
        &self,
        job_id: Uuid,
        attempts: u32,
        now: DateTime,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE muster_jobs
             SET status = 'done', finished_at = $3, lease_expires_at = NULL
             WHERE id = $1 AND status = 'running' AND attempts = $2",
        )
        .bind(job_id)
        .bind(to_i32(attempts, "attempts")?)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark job as done")?;

        held(job_id, attempts, result.rows_affected())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, attempts = decision.attempts(), terminal = decision.is_terminal()))]
    async fn mark_failed_or_requeue(
        &self,
        job_id: Uuid,
        decision: &FailureDecision,
    ) -> Result<(), QueueError> {
        let attempts = to_i32(decision.attempts(), "attempts")?;
        let query = match decision {
            FailureDecision::Requeue {
                error, retry_at, ..
            } => sqlx::query(
                "UPDATE muster_jobs
                 SET status = 'queued', scheduled_at = $3, error_text = $4, lease_expires_at = NULL
                 WHERE id = $1 AND status = 'running' AND attempts = $2",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(*retry_at)
            .bind(error.as_str()),
            FailureDecision::Fail {
                error, finished_at, ..
            } => sqlx::query(
                "UPDATE muster_jobs
                 SET status = 'failed', finished_at = $3, error_text = $4, lease_expires_at = NULL
                 WHERE id = $1 AND status = 'running' AND attempts = $2",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(*finished_at)
            .bind(error.as_str()),
        };

        let result = query
            .execute(&self.pool)
            .await
            .context("Failed to record job failure")?;

        held(job_id, decision.attempts(), result.rows_affected())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, attempts = attempts, until = %until))]
    async fn extend_lease(
        &self,
        job_id: Uuid,
        attempts: u32,
        until: DateTime,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE muster_jobs SET lease_expires_at = $3
             WHERE id = $1 AND status = 'running' AND attempts = $2",
        )
        .bind(job_id)
        .bind(to_i32(attempts, "attempts")?)
        .bind(until)
        .execute(&self.pool)
        .await
        .context("Failed to extend job lease")?;

        held(job_id, attempts, result.rows_affected())
    }

    #[instrument(skip_all, err, fields(limit = limit))]
    async fn reap_expired(
        &self,
        now: DateTime,
        limit: usize,
    ) -> Result<Vec<ReapedJob>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, ReapedRow>(
            "WITH expired AS (
                 SELECT id FROM muster_jobs
                 WHERE status = 'running' AND lease_expires_at < $1
                 ORDER BY lease_expires_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE muster_jobs j
             SET status = CASE WHEN j.attempts >= j.max_attempts THEN 'failed' ELSE 'queued' END,
                 finished_at = CASE WHEN j.attempts >= j.max_attempts THEN $1 ELSE j.finished_at END,
                 scheduled_at = CASE WHEN j.attempts >= j.max_attempts THEN j.scheduled_at ELSE $1 END,
                 lease_expires_at = NULL,
                 error_text = $3
             FROM expired
             WHERE j.id = expired.id
             RETURNING j.id, j.job_type, j.attempts, j.status",
        )
        .bind(now)
        .bind(limit)
        .bind(LEASE_EXPIRED)
        .fetch_all(&self.pool)
        .await
        .context("Failed to reap expired leases")?;

        rows.into_iter().map(ReapedJob::try_from).collect()
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM muster_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load job")?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip_all, err, fields(prefix = prefix))]
    async fn stats(&self, prefix: &str) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM muster_jobs
             WHERE job_type LIKE $1 ESCAPE '\\'
             GROUP BY status",
        )
        .bind(ClaimFilter::prefix(prefix).like_pattern())
        .fetch_all(&self.pool)
        .await
        .context("Failed to count jobs")?;

        QueueStats::from_counts(rows)
    }
}
