//! Append-only execution trace keyed by job.
//!
//! Writing a trace entry is best-effort: [`JobLogger`] reports sink failures on
//! the `muster::log_sink` tracing target and carries on, so a broken sink never
//! changes the outcome of a job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LogSinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LogSinkError::InvalidLevel(other.to_string())),
        }
    }
}

/// A trace record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: Uuid,
    pub module: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime,
}

impl LogEntry {
    pub fn new(
        job_id: Uuid,
        module: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            module: module.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogSinkError {
    #[error("Unknown log level '{0}'")]
    InvalidLevel(String),

    #[error("Failed to write log entry: {0}")]
    WriteError(#[from] anyhow::Error),
}

/// Insert-only store for trace entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<(), LogSinkError>;
}

/// A sink that drops everything. Used when a worker is built without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogSink;

#[async_trait]
impl LogSink for DiscardLogSink {
    async fn append(&self, _entry: LogEntry) -> Result<(), LogSinkError> {
        Ok(())
    }
}

/// The `log_fn` handed to handlers: a sink bound to one job and module.
#[derive(Clone)]
pub struct JobLogger {
    job_id: Uuid,
    module: String,
    sink: Arc<dyn LogSink>,
}

impl JobLogger {
    pub fn new(job_id: Uuid, module: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            job_id,
            module: module.into(),
            sink,
        }
    }

    /// Same job, different module name.
    pub fn for_module(&self, module: impl Into<String>) -> Self {
        Self {
            job_id: self.job_id,
            module: module.into(),
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Append an entry. Never fails: sink errors go to the fallback channel.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(self.job_id, self.module.clone(), level, message);
        if let Err(error) = self.sink.append(entry).await {
            tracing::warn!(
                target: "muster::log_sink",
                job_id = %self.job_id,
                module = %self.module,
                %level,
                %error,
                "Failed to append job log entry"
            );
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message).await
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await
    }
}

impl fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogger")
            .field("job_id", &self.job_id)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}
