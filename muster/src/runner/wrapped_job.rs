use crate::core::job_processor::{JobContext, JobError, JobProcessor};
use crate::core::job_type::JobType;
use crate::core::retry::RetryPolicy;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

/// Shorthand for boxed trait object for a WrappedJob.
pub type BoxedJobHandler = Box<dyn JobProcessor<Payload = serde_json::Value, Error = JobError>>;

/// Object-safe implementation of a job that can be used in runner. Generally speaking, you don't
/// need to directly use this type, the registry takes care of everything related to it.
pub struct WrappedJobHandler<T: JobProcessor> {
    job: T,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
{
    pub fn new(job: J) -> Self {
        Self { job }
    }

    pub fn boxed(self) -> BoxedJobHandler {
        Box::new(self) as BoxedJobHandler
    }

    /// Decode `payload` into `J::Payload`.
    pub fn decode(payload: &serde_json::Value) -> Result<J::Payload, JobError> {
        J::Payload::deserialize(payload)
            .map_err(|error| JobError::deserialization_error(error, payload))
    }

    /// Check that `payload` decodes into `J::Payload` without running the job.
    pub fn validate(payload: &serde_json::Value) -> Result<(), JobError> {
        Self::decode(payload).map(|_| ())
    }
}

impl<J> JobType for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
{
    fn job_type() -> &'static str {
        J::job_type()
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
{
    type Payload = serde_json::Value;
    type Error = JobError;

    #[instrument(skip_all, err, fields(job_id = %ctx.job.id, job_type = %Self::job_type()))]
    async fn handle(&self, ctx: JobContext, payload: Self::Payload) -> Result<(), Self::Error> {
        let typed_payload = Self::decode(&payload)?;

        self.job
            .handle(ctx, typed_payload)
            .await
            .map_err(Into::into)
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.job.retry_policy()
    }
}

impl<J> From<J> for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
{
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::NewJob;
    use crate::core::log_sink::{DiscardLogSink, JobLogger};
    use crate::core::queue::EnqueueOptions;
    use crate::core::{CancellationToken, Duration, Utc};
    use crate::memory::MemoryQueue;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    };

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestPayload {
        value: String,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("test error")]
    struct TestError;

    impl From<TestError> for JobError {
        fn from(e: TestError) -> Self {
            JobError::HandlerError(anyhow::anyhow!(e.to_string()))
        }
    }

    struct MockJobProcessor {
        should_fail: Arc<AtomicBool>,
        execution_count: Arc<AtomicU32>,
        retry_policy: Option<RetryPolicy>,
    }

    impl MockJobProcessor {
        fn new() -> Self {
            Self {
                should_fail: Arc::new(AtomicBool::new(false)),
                execution_count: Arc::new(AtomicU32::new(0)),
                retry_policy: None,
            }
        }

        fn fail_next(&self) {
            self.should_fail.store(true, Ordering::SeqCst);
        }
    }

    impl JobType for MockJobProcessor {
        fn job_type() -> &'static str {
            "tests.mock"
        }
    }

    #[async_trait]
    impl JobProcessor for MockJobProcessor {
        type Payload = TestPayload;
        type Error = TestError;

        async fn handle(&self, _ctx: JobContext, _payload: Self::Payload) -> Result<(), Self::Error> {
            self.execution_count.fetch_add(1, Ordering::SeqCst);

            if self.should_fail.load(Ordering::SeqCst) {
                Err(TestError)
            } else {
                Ok(())
            }
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            self.retry_policy
        }
    }

    fn context() -> JobContext {
        let mut job = NewJob::new("tests.mock", json!({}), EnqueueOptions::now()).into_job(Utc::now());
        job.attempts = 1;
        let log = JobLogger::new(job.id, "tests", Arc::new(DiscardLogSink));
        JobContext {
            job,
            queue: Arc::new(MemoryQueue::new()),
            log,
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn test_wrapped_job_handler_job_type() {
        assert_eq!(
            WrappedJobHandler::<MockJobProcessor>::job_type(),
            MockJobProcessor::job_type()
        );
    }

    #[test]
    fn test_wrapped_job_handler_retry_policy() {
        let mut mock = MockJobProcessor::new();
        mock.retry_policy = Some(RetryPolicy::fixed(Duration::seconds(5)));
        let wrapped = WrappedJobHandler::new(mock);
        assert_eq!(
            wrapped.retry_policy(),
            Some(RetryPolicy::fixed(Duration::seconds(5)))
        );

        let wrapped = WrappedJobHandler::new(MockJobProcessor::new());
        assert_eq!(wrapped.retry_policy(), None);
    }

    #[test]
    fn test_wrapped_job_handler_validate() {
        assert!(WrappedJobHandler::<MockJobProcessor>::validate(&json!({"value": "x"})).is_ok());
        assert!(matches!(
            WrappedJobHandler::<MockJobProcessor>::validate(&json!({"wrong_field": 1})),
            Err(JobError::Deserialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrapped_job_handler_execution_success() {
        let mock = MockJobProcessor::new();
        let execution_count = mock.execution_count.clone();
        let wrapped = WrappedJobHandler::new(mock).boxed();

        let result = wrapped
            .handle(context(), json!({"value": "success"}))
            .await;

        assert!(result.is_ok());
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrapped_job_handler_wrong_shape_never_reaches_handler() {
        let mock = MockJobProcessor::new();
        let execution_count = mock.execution_count.clone();
        let wrapped = WrappedJobHandler::new(mock);

        let result = wrapped.handle(context(), json!({"wrong_field": "value"})).await;

        match result.unwrap_err() {
            JobError::Deserialization { .. } => {}
            other => panic!("Expected Deserialization error, got {:?}", other),
        }
        assert_eq!(execution_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrapped_job_handler_execution_failure() {
        let mock = MockJobProcessor::new();
        mock.fail_next();
        let wrapped = WrappedJobHandler::new(mock);

        let result = wrapped.handle(context(), json!({"value": "fail"})).await;

        match result.unwrap_err() {
            JobError::HandlerError(e) => {
                assert_eq!(e.to_string(), "test error");
            }
            other => panic!("Expected HandlerError, got {:?}", other),
        }
    }
}
