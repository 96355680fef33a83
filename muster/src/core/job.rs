//! The persisted unit of work and its lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::core::DateTime;

/// Attempts allowed when the producer does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Priority used when the producer does not say otherwise. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Lifecycle state of a job.
///
/// Transitions are forward-only: `Queued → Running`, `Running → Done`,
/// `Running → Failed` and `Running → Queued` (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// `Done` and `Failed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: DateTime,
    pub status: JobStatus,
    /// Incremented once per claim.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime,
    pub started_at: Option<DateTime>,
    pub finished_at: Option<DateTime>,
    pub lease_expires_at: Option<DateTime>,
    pub error_text: Option<String>,
}

impl Job {
    /// True when a failure on the current attempt would be terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job about to be inserted. Built by [`crate::core::queue::QueueExt::schedule`]
/// or by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: DateTime,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: crate::core::queue::EnqueueOptions,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            payload,
            priority: options.priority(),
            scheduled_at: options.scheduled_at(),
            max_attempts: options.max_attempts(),
        }
    }

    /// Checks the fields every backend relies on before inserting.
    pub fn validate(&self) -> Result<(), crate::core::queue::QueueError> {
        crate::core::job_type::validate_job_type(&self.job_type)
            .map_err(|e| crate::core::queue::QueueError::InvalidJob(e.to_string()))?;
        if self.max_attempts == 0 {
            return Err(crate::core::queue::QueueError::InvalidJob(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The row a backend would hold right after insertion.
    pub fn into_job(self, created_at: DateTime) -> Job {
        Job {
            id: self.id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at,
            started_at: None,
            finished_at: None,
            lease_expires_at: None,
            error_text: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::EnqueueOptions;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("retrying".parse::<JobStatus>().is_err());
    }

    #[test]
    fn transitions_are_forward_only() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));

        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn new_job_takes_options() {
        let at = Utc::now();
        let job = NewJob::new(
            "memory.ingest",
            json!({"memory_id": 42}),
            EnqueueOptions::new().at(at).with_priority(5).with_max_attempts(7),
        );
        assert_eq!(job.priority, 5);
        assert_eq!(job.scheduled_at, at);
        assert_eq!(job.max_attempts, 7);
        assert!(job.validate().is_ok());

        let row = job.clone().into_job(at);
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.id, job.id);
    }

    #[test]
    fn new_job_rejects_zero_attempts_and_bad_type() {
        let job = NewJob::new("a.b", json!(null), EnqueueOptions::new().with_max_attempts(0));
        assert!(job.validate().is_err());

        let job = NewJob::new("", json!(null), EnqueueOptions::new());
        assert!(job.validate().is_err());
    }

    #[test]
    fn last_attempt() {
        let mut job = NewJob::new("a.b", json!(null), EnqueueOptions::new().with_max_attempts(2))
            .into_job(Utc::now());
        job.attempts = 1;
        assert!(!job.is_last_attempt());
        job.attempts = 2;
        assert!(job.is_last_attempt());
    }
}
