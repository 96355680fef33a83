use anyhow::Context;
use async_trait::async_trait;
use muster::core::log_sink::{LogEntry, LogLevel, LogSink, LogSinkError};
use muster::core::DateTime;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

/// Job trace entries in the `muster_job_logs` table.
#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct LogRow {
    job_id: Uuid,
    module: String,
    level: String,
    msg: String,
    ts: DateTime,
}

impl PgLogSink {
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Entries of one job in insertion order.
    #[instrument(skip_all, err, fields(job_id = %job_id))]
    pub async fn job_logs(&self, job_id: Uuid) -> Result<Vec<LogEntry>, LogSinkError> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT job_id, module, level, msg, ts FROM muster_job_logs WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read job logs")?;

        rows.into_iter()
            .map(|row| -> Result<LogEntry, LogSinkError> {
                Ok(LogEntry {
                    job_id: row.job_id,
                    module: row.module,
                    level: row.level.parse::<LogLevel>()?,
                    message: row.msg,
                    timestamp: row.ts,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), LogSinkError> {
        sqlx::query(
            "INSERT INTO muster_job_logs (job_id, module, level, msg, ts) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.job_id)
        .bind(&entry.module)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to append job log")?;
        Ok(())
    }
}
