//! Enqueue boundary for requests coming from outside the process.
//!
//! The dispatcher turns a loosely typed [`EnqueueRequest`] (as decoded from an
//! HTTP body, for instance) into a stored job and renders the outcome as an
//! [`EnqueueResponse`] with a status code. It does not bind a transport.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::core::job::NewJob;
use crate::core::queue::{EnqueueOptions, Queue, QueueError};
use crate::core::DateTime;

/// Checks a payload against the handler registered for its job type.
pub trait PayloadValidator: Send + Sync {
    /// `Err` carries a message suitable for the caller.
    fn validate_payload(&self, job_type: &str, payload: &serde_json::Value) -> Result<(), String>;

    /// Attempt ceiling to use when the request does not name one.
    fn default_max_attempts(&self, _job_type: &str) -> Option<u32> {
        None
    }
}

/// An enqueue request as received. Every field is optional on the wire so that
/// missing fields surface as validation errors rather than decode errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default, alias = "type")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub run_at: Option<DateTime>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: Some(job_type.into()),
            payload: Some(payload),
            ..Self::default()
        }
    }
}

/// Response body: `{"ok": true, "job_id": ...}` or `{"ok": false, "error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnqueueResponse {
    pub fn accepted(job_id: Uuid) -> Self {
        Self {
            ok: true,
            job_id: Some(job_id),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            job_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("Failed to enqueue job: {0}")]
    Persistence(#[source] QueueError),
}

impl DispatchError {
    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::Validation(_) => 400,
            DispatchError::Persistence(_) => 500,
        }
    }
}

impl From<QueueError> for DispatchError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::InvalidJob(message) => DispatchError::Validation(message),
            other => DispatchError::Persistence(other),
        }
    }
}

/// Validates enqueue requests and hands them to the queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn Queue>,
    validator: Option<Arc<dyn PayloadValidator>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            queue,
            validator: None,
        }
    }

    /// Reject job types without a handler and payloads the handler cannot decode.
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[instrument(skip_all, err, fields(job_type = request.job_type.as_deref().unwrap_or_default()))]
    pub async fn dispatch(&self, request: EnqueueRequest) -> Result<Uuid, DispatchError> {
        let job_type = match request.job_type.as_deref().map(str::trim) {
            Some(job_type) if !job_type.is_empty() => job_type.to_string(),
            _ => return Err(DispatchError::Validation("job_type is required".to_string())),
        };
        let payload = request
            .payload
            .ok_or_else(|| DispatchError::Validation("payload is required".to_string()))?;

        let mut options = EnqueueOptions::now();
        if let Some(run_at) = request.run_at {
            options = options.at(run_at);
        }
        if let Some(priority) = request.priority {
            options = options.with_priority(priority);
        }

        let mut max_attempts = request.max_attempts;
        if let Some(validator) = &self.validator {
            validator
                .validate_payload(&job_type, &payload)
                .map_err(DispatchError::Validation)?;
            max_attempts = max_attempts.or_else(|| validator.default_max_attempts(&job_type));
        }
        if let Some(max_attempts) = max_attempts {
            options = options.with_max_attempts(max_attempts);
        }

        let job_id = self
            .queue
            .enqueue(NewJob::new(job_type, payload, options))
            .await?;
        tracing::debug!(%job_id, "Job enqueued");
        Ok(job_id)
    }

    /// Dispatch and render the outcome as `(status, body)`.
    pub async fn respond(&self, request: EnqueueRequest) -> (u16, EnqueueResponse) {
        match self.dispatch(request).await {
            Ok(job_id) => (200, EnqueueResponse::accepted(job_id)),
            Err(error) => (error.status_code(), EnqueueResponse::rejected(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;
    use crate::memory::MemoryQueue;
    use chrono::{Duration, Utc};
    use serde_json::json;

    struct OnlyIngest;

    impl PayloadValidator for OnlyIngest {
        fn validate_payload(
            &self,
            job_type: &str,
            payload: &serde_json::Value,
        ) -> Result<(), String> {
            if job_type != "memory.ingest" {
                return Err(format!("No handler registered for job type '{job_type}'"));
            }
            if payload.get("memory_id").and_then(|v| v.as_i64()).is_none() {
                return Err("memory_id must be an integer".to_string());
            }
            Ok(())
        }

        fn default_max_attempts(&self, _job_type: &str) -> Option<u32> {
            Some(7)
        }
    }

    fn dispatcher() -> (Arc<MemoryQueue>, Dispatcher) {
        let queue = Arc::new(MemoryQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());
        (queue, dispatcher)
    }

    #[tokio::test]
    async fn accepted_request_is_stored() {
        let (queue, dispatcher) = dispatcher();
        let run_at = Utc::now() + Duration::minutes(5);
        let request = EnqueueRequest {
            priority: Some(-3),
            run_at: Some(run_at),
            max_attempts: Some(4),
            ..EnqueueRequest::new("memory.ingest", json!({"memory_id": 42}))
        };

        let (status, response) = dispatcher.respond(request).await;
        assert_eq!(status, 200);
        assert!(response.ok);

        let job = queue
            .get_job(response.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_type, "memory.ingest");
        assert_eq!(job.payload, json!({"memory_id": 42}));
        assert_eq!(job.priority, -3);
        assert_eq!(job.scheduled_at, run_at);
        assert_eq!(job.max_attempts, 4);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let (queue, dispatcher) = dispatcher();

        let (status, response) = dispatcher
            .respond(EnqueueRequest {
                payload: Some(json!({})),
                ..EnqueueRequest::default()
            })
            .await;
        assert_eq!(status, 400);
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("job_type is required"));

        let (status, response) = dispatcher
            .respond(EnqueueRequest {
                job_type: Some("  ".to_string()),
                payload: Some(json!({})),
                ..EnqueueRequest::default()
            })
            .await;
        assert_eq!(status, 400);
        assert_eq!(response.error.as_deref(), Some("job_type is required"));

        let (status, response) = dispatcher
            .respond(EnqueueRequest {
                job_type: Some("memory.ingest".to_string()),
                ..EnqueueRequest::default()
            })
            .await;
        assert_eq!(status, 400);
        assert_eq!(response.error.as_deref(), Some("payload is required"));

        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn malformed_job_type_is_a_validation_error() {
        let (_, dispatcher) = dispatcher();
        let (status, response) = dispatcher
            .respond(EnqueueRequest::new("memory..ingest", json!({})))
            .await;
        assert_eq!(status, 400);
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn store_failure_is_a_server_error() {
        let (queue, dispatcher) = dispatcher();
        queue.set_unavailable(true);

        let (status, response) = dispatcher
            .respond(EnqueueRequest::new("memory.ingest", json!({"memory_id": 1})))
            .await;
        assert_eq!(status, 500);
        assert!(!response.ok);
        assert!(response.job_id.is_none());
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn validator_rejects_unknown_types_and_bad_payloads() {
        let (queue, dispatcher) = dispatcher();
        let dispatcher = dispatcher.with_validator(Arc::new(OnlyIngest));

        let (status, _) = dispatcher
            .respond(EnqueueRequest::new("memory.compact", json!({"memory_id": 1})))
            .await;
        assert_eq!(status, 400);

        let (status, response) = dispatcher
            .respond(EnqueueRequest::new("memory.ingest", json!({"memory_id": "x"})))
            .await;
        assert_eq!(status, 400);
        assert_eq!(response.error.as_deref(), Some("memory_id must be an integer"));

        let (status, response) = dispatcher
            .respond(EnqueueRequest::new("memory.ingest", json!({"memory_id": 1})))
            .await;
        assert_eq!(status, 200);
        let job = queue
            .get_job(response.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.max_attempts, 7);
    }

    #[test]
    fn response_shape() {
        let id = Uuid::now_v7();
        assert_eq!(
            serde_json::to_value(EnqueueResponse::accepted(id)).unwrap(),
            json!({"ok": true, "job_id": id})
        );
        assert_eq!(
            serde_json::to_value(EnqueueResponse::rejected("nope")).unwrap(),
            json!({"ok": false, "error": "nope"})
        );
    }

    #[test]
    fn request_accepts_type_alias() {
        let request: EnqueueRequest =
            serde_json::from_value(json!({"type": "memory.ingest", "payload": {}})).unwrap();
        assert_eq!(request.job_type.as_deref(), Some("memory.ingest"));
        assert_eq!(request.priority, None);
    }
}
