use crate::types::{to_millis, JobRow, ReapedRow};
use anyhow::Context;
use async_trait::async_trait;
use muster::core::job::{Job, NewJob};
use muster::core::queue::{ClaimFilter, Queue, QueueError, QueueStats, ReapedJob};
use muster::core::retry::FailureDecision;
use muster::core::{DateTime, Duration, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

const LEASE_EXPIRED: &str = "lease expired";

/// An implementation of the Queue backed by SQLite.
///
/// SQLite serializes writers, so a claim is a single `UPDATE ... RETURNING`
/// statement. Use a pool built by [`crate::make_pool`]; prefix matching relies on
/// `case_sensitive_like`.
#[derive(Clone)]
pub struct SqliteQueue {
    pub(crate) pool: SqlitePool,
}

impl SqliteQueue {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn held(job_id: Uuid, attempts: u32, rows_affected: u64) -> Result<(), QueueError> {
    if rows_affected == 0 {
        return Err(QueueError::lease_lost(job_id, attempts));
    }
    Ok(())
}

#[async_trait]
impl Queue for SqliteQueue {
    #[instrument(skip_all, err, ret, fields(job_type = %job.job_type, priority = job.priority))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        job.validate()?;
        let payload_text = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::serialize_error(job.job_type.clone(), e))?;

        sqlx::query(
            "INSERT INTO muster_jobs (id, job_type, payload, priority, scheduled_at, max_attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(payload_text)
        .bind(job.priority)
        .bind(to_millis(job.scheduled_at))
        .bind(i64::from(job.max_attempts))
        .bind(to_millis(Utc::now()))
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
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE muster_jobs SET status = 'running', attempts = attempts + 1, started_at = ",
        );
        builder.push_bind(to_millis(now));
        builder.push(", lease_expires_at = ");
        builder.push_bind(to_millis(now + lease));
        builder.push(
            " WHERE status = 'queued' AND id IN (SELECT id FROM muster_jobs WHERE status = 'queued' AND scheduled_at <= ",
        );
        builder.push_bind(to_millis(now));
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
        builder.push(" ORDER BY priority ASC, scheduled_at ASC LIMIT 1) RETURNING *");

        let row = builder
            .build()
            .try_map(|row| JobRow::from_row(&row))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check out a job from the queue")?;

        row.map(Job::try_from).transpose()
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
             SET status = 'done', finished_at = ?3, lease_expires_at = NULL
             WHERE id = ?1 AND status = 'running' AND attempts = ?2",
        )
        .bind(job_id)
        .bind(i64::from(attempts))
        .bind(to_millis(now))
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
        let attempts = i64::from(decision.attempts());
        let query = match decision {
            FailureDecision::Requeue {
                error, retry_at, ..
            } => sqlx::query(
                "UPDATE muster_jobs
                 SET status = 'queued', scheduled_at = ?3, error_text = ?4, lease_expires_at = NULL
                 WHERE id = ?1 AND status = 'running' AND attempts = ?2",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(to_millis(*retry_at))
            .bind(error.as_str()),
            FailureDecision::Fail {
                error, finished_at, ..
            } => sqlx::query(
                "UPDATE muster_jobs
                 SET status = 'failed', finished_at = ?3, error_text = ?4, lease_expires_at = NULL
                 WHERE id = ?1 AND status = 'running' AND attempts = ?2",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(to_millis(*finished_at))
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
            "UPDATE muster_jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND status = 'running' AND attempts = ?2",
        )
        .bind(job_id)
        .bind(i64::from(attempts))
        .bind(to_millis(until))
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
            "UPDATE muster_jobs
             SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'queued' END,
                 finished_at = CASE WHEN attempts >= max_attempts THEN ?1 ELSE finished_at END,
                 scheduled_at = CASE WHEN attempts >= max_attempts THEN scheduled_at ELSE ?1 END,
                 lease_expires_at = NULL,
                 error_text = ?3
             WHERE id IN (
                 SELECT id FROM muster_jobs
                 WHERE status = 'running' AND lease_expires_at < ?1
                 ORDER BY lease_expires_at
                 LIMIT ?2
             )
             RETURNING id, job_type, attempts, status",
        )
        .bind(to_millis(now))
        .bind(limit)
        .bind(LEASE_EXPIRED)
        .fetch_all(&self.pool)
        .await
        .context("Failed to reap expired leases")?;

        rows.into_iter().map(ReapedJob::try_from).collect()
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM muster_jobs WHERE id = ?1")
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
             WHERE job_type LIKE ?1 ESCAPE '\\'
             GROUP BY status",
        )
        .bind(ClaimFilter::prefix(prefix).like_pattern())
        .fetch_all(&self.pool)
        .await
        .context("Failed to count jobs")?;

        QueueStats::from_counts(rows)
    }
}
