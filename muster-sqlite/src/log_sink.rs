use crate::types::{from_millis, to_millis};
use anyhow::Context;
use async_trait::async_trait;
use muster::core::log_sink::{LogEntry, LogLevel, LogSink, LogSinkError};
use sqlx::{FromRow, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

/// Job trace entries in the `muster_job_logs` table.
#[derive(Clone)]
pub struct SqliteLogSink {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct LogRow {
    job_id: Uuid,
    module: String,
    level: String,
    msg: String,
    ts: i64,
}

impl SqliteLogSink {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Entries of one job in insertion order.
    #[instrument(skip_all, err, fields(job_id = %job_id))]
    pub async fn job_logs(&self, job_id: Uuid) -> Result<Vec<LogEntry>, LogSinkError> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT job_id, module, level, msg, ts FROM muster_job_logs WHERE job_id = ?1 ORDER BY id",
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
                    timestamp: from_millis(row.ts).map_err(anyhow::Error::new)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LogSink for SqliteLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), LogSinkError> {
        sqlx::query(
            "INSERT INTO muster_job_logs (job_id, module, level, msg, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(entry.job_id)
        .bind(&entry.module)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(to_millis(entry.timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to append job log")?;
        Ok(())
    }
}
