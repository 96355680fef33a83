use muster::core::job::{Job, JobStatus};
use muster::core::queue::{QueueError, ReapedJob};
use muster::core::DateTime;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: Uuid,
    pub(crate) job_type: String,
    pub(crate) payload: sqlx::types::JsonValue,
    pub(crate) priority: i32,
    pub(crate) scheduled_at: DateTime,
    pub(crate) status: String,
    pub(crate) attempts: i32,
    pub(crate) max_attempts: i32,
    pub(crate) created_at: DateTime,
    pub(crate) started_at: Option<DateTime>,
    pub(crate) finished_at: Option<DateTime>,
    pub(crate) lease_expires_at: Option<DateTime>,
    pub(crate) error_text: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            lease_expires_at: row.lease_expires_at,
            error_text: row.error_text,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ReapedRow {
    pub(crate) id: Uuid,
    pub(crate) job_type: String,
    pub(crate) attempts: i32,
    pub(crate) status: String,
}

impl TryFrom<ReapedRow> for ReapedJob {
    type Error = QueueError;

    fn try_from(row: ReapedRow) -> Result<Self, Self::Error> {
        Ok(ReapedJob {
            id: row.id,
            job_type: row.job_type,
            attempts: row.attempts.max(0) as u32,
            status: parse_status(&row.status)?,
        })
    }
}

fn parse_status(status: &str) -> Result<JobStatus, QueueError> {
    status
        .parse()
        .map_err(|e| QueueError::DatabaseError(anyhow::Error::new(e)))
}
