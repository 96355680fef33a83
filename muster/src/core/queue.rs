use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::job::{Job, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
use crate::core::job_processor::JobProcessor;
use crate::core::job_type::like_prefix_pattern;
use crate::core::retry::FailureDecision;
use crate::core::{DateTime, Duration};

/// Enqueue options.
///
/// Provides a builder for configuring when, in which order and how many times a
/// job should run.
///
/// # Examples
///
/// ```rust
/// use muster::core::queue::EnqueueOptions;
/// use chrono::Duration;
///
/// // Eligible immediately
/// let opts = EnqueueOptions::now();
///
/// // Eligible in 5 minutes, ahead of priority-0 work, at most 5 attempts
/// let opts = EnqueueOptions::new()
///     .in_duration(Duration::minutes(5))
///     .with_priority(-10)
///     .with_max_attempts(5);
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub(crate) scheduled_at: DateTime,
    pub(crate) priority: i32,
    pub(crate) max_attempts: Option<u32>,
}

impl EnqueueOptions {
    /// Create new options with default values (immediate, priority 0, 3 attempts).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options for immediate scheduling.
    pub fn now() -> Self {
        Self::default()
    }

    /// Set the earliest time the job may be claimed.
    pub fn at(mut self, scheduled_at: DateTime) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    /// Make the job eligible after a duration from now.
    pub fn in_duration(mut self, duration: Duration) -> Self {
        self.scheduled_at = Utc::now() + duration;
        self
    }

    /// Set the job priority (lower values run first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set how many claims the job gets before a failure becomes terminal.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(&self) -> DateTime {
        self.scheduled_at
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The attempt ceiling, falling back to [`DEFAULT_MAX_ATTEMPTS`] when unset.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            scheduled_at: Utc::now(),
            priority: DEFAULT_PRIORITY,
            max_attempts: None,
        }
    }
}

/// Selects which queued jobs a claim may return.
///
/// Every job type starting with `prefix` matches. When `job_types` is not empty
/// the job type must also be one of them, which is how a worker avoids claiming
/// work it has no handler for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    prefix: String,
    job_types: Vec<String>,
}

impl ClaimFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            job_types: Vec::new(),
        }
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = job_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn type_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job_types(&self) -> &[String] {
        &self.job_types
    }

    /// `LIKE` pattern for the prefix; use with `ESCAPE '\'`.
    pub fn like_pattern(&self) -> String {
        like_prefix_pattern(&self.prefix)
    }

    pub fn matches(&self, job_type: &str) -> bool {
        job_type.starts_with(&self.prefix)
            && (self.job_types.is_empty() || self.job_types.iter().any(|t| t == job_type))
    }
}

/// A running job recovered by [`Queue::reap_expired`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapedJob {
    pub id: Uuid,
    pub job_type: String,
    pub attempts: u32,
    /// `Queued` when the job gets another attempt, `Failed` when it ran out.
    pub status: JobStatus,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.done + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// Builds stats from `(status, count)` rows as returned by a `GROUP BY` query.
    pub fn from_counts<I>(rows: I) -> Result<Self, QueueError>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut stats = Self::default();
        for (status, count) in rows {
            let status: JobStatus = status
                .parse()
                .map_err(|e| QueueError::DatabaseError(anyhow::Error::new(e)))?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

/// The queue of record. Responsible for inserting jobs, handing each one to exactly one
/// worker, and recording how each attempt ended.
///
/// The trait is object safe; handlers receive it as `Arc<dyn Queue>`.
///
/// ### Ordering
///
/// Among jobs eligible at the same instant, lower `priority` is claimed first, then
/// earlier `scheduled_at`. There is no total order across concurrent claimers.
///
/// ### Fencing
///
/// Calls that change a running job name the attempt number returned by the claim.
/// They only apply while the job is still running under that attempt and fail with
/// [`QueueError::LeaseLost`] otherwise.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Insert one queued job and return its id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError>;

    /// Atomically claim the next eligible job matching `filter`.
    ///
    /// The returned job is `Running`, its `attempts` already incremented and its lease
    /// set to `now + lease`. Returns `None` if no job is eligible. Does not wait.
    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        now: DateTime,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError>;

    /// Mark a claimed job as done.
    async fn mark_done(&self, job_id: Uuid, attempts: u32, now: DateTime)
        -> Result<(), QueueError>;

    /// Apply the outcome of a failed attempt: requeue or fail terminally.
    async fn mark_failed_or_requeue(
        &self,
        job_id: Uuid,
        decision: &FailureDecision,
    ) -> Result<(), QueueError>;

    /// Push the lease of a running job out to `until`.
    async fn extend_lease(
        &self,
        job_id: Uuid,
        attempts: u32,
        until: DateTime,
    ) -> Result<(), QueueError>;

    /// Recover up to `limit` running jobs whose lease expired before `now`.
    async fn reap_expired(&self, now: DateTime, limit: usize)
        -> Result<Vec<ReapedJob>, QueueError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError>;

    /// Count jobs per status among job types starting with `prefix`.
    async fn stats(&self, prefix: &str) -> Result<QueueStats, QueueError>;
}

/// Typed helpers on top of [`Queue`].
#[async_trait]
pub trait QueueExt: Queue {
    /// Enqueue a job for the handler `J`.
    ///
    /// Unless `options` sets one, the attempt ceiling is `J::max_attempts()`.
    ///
    /// ```rust,ignore
    /// queue.schedule::<IngestMemory>(IngestPayload { memory_id: 42 }, EnqueueOptions::now().with_priority(5)).await?;
    /// ```
    async fn schedule<J>(
        &self,
        payload: J::Payload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError>
    where
        J: JobProcessor + 'static,
    {
        let job_type = J::job_type();
        let payload = serde_json::to_value(&payload)
            .map_err(|e| QueueError::serialize_error(job_type.to_string(), e))?;
        let options = match options.max_attempts {
            Some(_) => options,
            None => options.with_max_attempts(J::max_attempts()),
        };
        self.enqueue(NewJob::new(job_type, payload, options)).await
    }
}

impl<Q: Queue + ?Sized> QueueExt for Q {}

/// Errors related to queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// The job was rejected before reaching the store.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Failed to serialize payload.
    #[error("Failed to serialize payload for job type '{job_type}': {error}")]
    SerializeError {
        job_type: String,
        #[source]
        error: serde_json::Error,
    },

    /// Failed to deserialize payload with context for debugging.
    #[error("Failed to deserialize payload for job {job_id} (type: '{job_type}'): {error}\nPayload sample (first {payload_size} bytes): {payload_sample}")]
    DeserializeError {
        job_id: Uuid,
        job_type: String,
        #[source]
        error: serde_json::Error,
        payload_sample: String,
        payload_size: usize,
    },

    /// Job not found.
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    /// The job is no longer running under the attempt the caller claimed.
    #[error("Job {job_id} is no longer held by attempt {attempts}")]
    LeaseLost { job_id: Uuid, attempts: u32 },

    /// Database or other backend error.
    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

impl QueueError {
    /// Create a deserialization error with payload context.
    ///
    /// Includes a sample of the payload (first 500 chars) for debugging.
    pub fn deserialize_error(
        job_id: Uuid,
        job_type: String,
        payload: &[u8],
        error: serde_json::Error,
    ) -> Self {
        let payload_size = payload.len();
        let payload_sample = String::from_utf8_lossy(payload).chars().take(500).collect();

        Self::DeserializeError {
            job_id,
            job_type,
            error,
            payload_sample,
            payload_size,
        }
    }

    pub fn serialize_error(job_type: String, error: serde_json::Error) -> Self {
        Self::SerializeError { job_type, error }
    }

    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::JobNotFound { job_id }
    }

    pub fn lease_lost(job_id: Uuid, attempts: u32) -> Self {
        Self::LeaseLost { job_id, attempts }
    }
}
