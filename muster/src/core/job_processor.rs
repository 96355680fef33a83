use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::job::{Job, DEFAULT_MAX_ATTEMPTS};
use crate::core::job_type::JobType;
use crate::core::log_sink::JobLogger;
use crate::core::queue::Queue;
use crate::core::retry::RetryPolicy;

/// Everything a handler gets besides its payload.
#[derive(Clone)]
pub struct JobContext {
    /// The claimed job. `attempts` already counts the current attempt.
    pub job: Job,
    /// Queue accessor, e.g. for enqueuing follow-up jobs.
    pub queue: Arc<dyn Queue>,
    /// Trace sink bound to this job.
    pub log: JobLogger,
    /// Fires when the worker process is shutting down. The worker still waits for
    /// the handler to return; there is no way to abort a running job.
    pub shutdown: CancellationToken,
}

/// A job handler with a typed payload.
///
/// Your job processor must implement both `JobProcessor` and `JobType`.
/// The payload is decoded from the stored JSON before `handle` is called, so a
/// malformed payload never reaches handler code.
///
/// Handlers must be safe to run more than once on the same payload: a job is
/// redelivered after a failure or after its lease expires.
///
/// ## Example
/// ```rust,ignore
/// use muster::prelude::*;
///
/// struct IngestMemory {
///     store: MemoryStore,
/// }
///
/// impl JobType for IngestMemory {
///     fn job_type() -> &'static str {
///         "memory.ingest"
///     }
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct IngestPayload {
///     memory_id: i64,
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for IngestMemory {
///     type Payload = IngestPayload;
///     type Error = anyhow::Error;
///
///     async fn handle(&self, ctx: JobContext, payload: Self::Payload) -> Result<(), Self::Error> {
///         ctx.log.info(format!("ingesting memory {}", payload.memory_id)).await;
///         self.store.ingest(payload.memory_id).await
///     }
/// }
/// ```
///
/// ## Services
/// If your job processor requires external services (database client, REST client, etc.),
/// add them directly as struct fields.
#[async_trait]
pub trait JobProcessor: JobType + Send + Sync {
    type Payload: Serialize + DeserializeOwned + Send + Sync;

    /// Should implement `Into<JobError>`; `anyhow::Error` and `Infallible` do.
    type Error: Send + Into<JobError>;

    /// Execute the job. Returning an error fails the attempt.
    async fn handle(&self, ctx: JobContext, payload: Self::Payload) -> Result<(), Self::Error>;

    /// Attempt ceiling used when a job of this type is enqueued without one.
    fn max_attempts() -> u32
    where
        Self: Sized,
    {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Retry policy for this job type. `None` uses the worker's policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Error types for job processing.
#[derive(Error, Debug)]
pub enum JobError {
    /// Failed to deserialize job payload with context.
    #[error("Failed to deserialize payload: {error}\nPayload sample: {payload_sample}")]
    Deserialization {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    /// No handler is registered for the job's type.
    #[error("No handler registered for job type '{0}'")]
    UnknownJobType(String),

    /// The handler ran past the worker's execution timeout.
    #[error("Job did not finish within {0:#?}")]
    Timeout(std::time::Duration),

    /// Error from job handler implementation.
    #[error("Job handler error: {0}")]
    HandlerError(#[source] anyhow::Error),
}

impl JobError {
    /// Create a deserialization error with payload context.
    pub fn deserialization_error(error: serde_json::Error, payload: &serde_json::Value) -> Self {
        let payload_sample = payload.to_string().chars().take(500).collect();

        Self::Deserialization {
            error,
            payload_sample,
        }
    }

    /// Errors that another attempt cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobError::Deserialization { .. })
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Deserialization { .. } => "deserialization",
            JobError::UnknownJobType(_) => "unknown_job_type",
            JobError::Timeout(_) => "timeout",
            JobError::HandlerError(_) => "handler_error",
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        JobError::HandlerError(error)
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialization_is_terminal() {
        let payload = json!({"memory_id": "not a number"});
        let error = serde_json::from_value::<u64>(payload.clone()).unwrap_err();
        let error = JobError::deserialization_error(error, &payload);
        assert!(error.is_terminal());
        assert_eq!(error.kind(), "deserialization");
        assert!(error.to_string().contains("not a number"));
    }

    #[test]
    fn handler_errors_are_retriable() {
        let error: JobError = anyhow::anyhow!("upstream timed out").into();
        assert!(!error.is_terminal());
        assert_eq!(error.kind(), "handler_error");
        assert!(error.to_string().contains("upstream timed out"));

        assert!(!JobError::UnknownJobType("x.y".into()).is_terminal());
        assert!(!JobError::Timeout(std::time::Duration::from_secs(1)).is_terminal());
    }
}
