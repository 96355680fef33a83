use muster::core::job::{Job, JobStatus};
use muster::core::queue::{QueueError, ReapedJob};
use muster::core::DateTime;
use sqlx::FromRow;
use uuid::Uuid;

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(ts: DateTime) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime, QueueError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        QueueError::DatabaseError(anyhow::anyhow!("Timestamp {ms} is out of range"))
    })
}

fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime>, QueueError> {
    ms.map(from_millis).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: Uuid,
    pub(crate) job_type: String,
    pub(crate) payload: String, // JSON as TEXT in SQLite
    pub(crate) priority: i32,
    pub(crate) scheduled_at: i64,
    pub(crate) status: String,
    pub(crate) attempts: i64,
    pub(crate) max_attempts: i64,
    pub(crate) created_at: i64,
    pub(crate) started_at: Option<i64>,
    pub(crate) finished_at: Option<i64>,
    pub(crate) lease_expires_at: Option<i64>,
    pub(crate) error_text: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| {
            QueueError::deserialize_error(row.id, row.job_type.clone(), row.payload.as_bytes(), e)
        })?;

        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            payload,
            priority: row.priority,
            scheduled_at: from_millis(row.scheduled_at)?,
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: from_millis(row.created_at)?,
            started_at: from_millis_opt(row.started_at)?,
            finished_at: from_millis_opt(row.finished_at)?,
            lease_expires_at: from_millis_opt(row.lease_expires_at)?,
            error_text: row.error_text,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ReapedRow {
    pub(crate) id: Uuid,
    pub(crate) job_type: String,
    pub(crate) attempts: i64,
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
