//! The polling worker loop.
//!
//! A [`Worker`] serves one job type prefix: it claims the next eligible job,
//! runs the registered handler while keeping the lease alive, and records how
//! the attempt ended. Any number of workers, in one process or many, can poll
//! the same store.

use super::registry::{HandlerRegistry, RegistryError};
use crate::core::job::Job;
use crate::core::job_processor::{JobContext, JobError};
use crate::core::log_sink::{DiscardLogSink, JobLogger, LogSink};
use crate::core::queue::{ClaimFilter, Queue, QueueError};
use crate::core::retry::{FailureDecision, RetryPolicy};
use crate::core::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Module name used for the worker's own trace entries.
pub const WORKER_LOG_MODULE: &str = "worker";

/// Options for a worker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WorkerOptions {
    /// Job types served by this worker start with this prefix.
    pub type_prefix: String,

    /// Sleep between polls that found nothing (default: 1.5 seconds)
    pub poll_interval: Duration,

    /// How long a claim stays valid without a heartbeat (default: 5 minutes).
    /// Heartbeats run every third of it.
    pub lease_duration: chrono::Duration,

    /// Sleep after a store error (default: 5 seconds)
    pub error_backoff: Duration,

    /// Fail an attempt that runs longer than this (default: none)
    pub execution_timeout: Option<Duration>,

    /// Used for handlers that do not define their own policy.
    pub retry_policy: RetryPolicy,
}

impl WorkerOptions {
    pub fn new(type_prefix: impl Into<String>) -> Self {
        Self {
            type_prefix: type_prefix.into(),
            poll_interval: Duration::from_millis(1500),
            lease_duration: chrono::Duration::minutes(5),
            error_backoff: Duration::from_secs(5),
            execution_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: chrono::Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_execution_timeout(mut self, execution_timeout: Duration) -> Self {
        self.execution_timeout = Some(execution_timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// How a processed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub job_type: String,
    pub attempts: u32,
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    Requeued { retry_at: DateTime, error: String },
    Failed { error: String },
    /// The claim was lost before the outcome could be recorded; another worker
    /// or the reaper owns the job now.
    LeaseLost,
}

/// Errors returned when building a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Invalid worker options: {0}")]
    InvalidOptions(String),
}

/// Claims and runs jobs under one prefix.
pub struct Worker {
    queue: Arc<dyn Queue>,
    registry: Arc<HandlerRegistry>,
    log_sink: Arc<dyn LogSink>,
    filter: ClaimFilter,
    heartbeat_interval: Duration,
    options: WorkerOptions,
}

impl Worker {
    /// Build a worker. Fails when nothing is registered under the prefix.
    pub fn new(
        queue: Arc<dyn Queue>,
        registry: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        registry.validate_prefix(&options.type_prefix)?;

        let heartbeat_interval = (options.lease_duration / 3)
            .to_std()
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| {
                WorkerError::InvalidOptions(format!(
                    "lease duration must be positive, got {}",
                    options.lease_duration
                ))
            })?;
        let filter = registry.claim_filter(&options.type_prefix);

        info!(
            type_prefix = %options.type_prefix,
            job_types = ?filter.job_types(),
            poll_interval = ?options.poll_interval,
            lease_duration = %options.lease_duration,
            "Initializing worker"
        );

        Ok(Self {
            queue,
            registry,
            log_sink: Arc::new(DiscardLogSink),
            filter,
            heartbeat_interval,
            options,
        })
    }

    /// Sink for per-job trace entries. Defaults to discarding them.
    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = log_sink;
        self
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Claim and process at most one job. `Ok(None)` when nothing was eligible.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        self.process_next_with(&CancellationToken::new()).await
    }

    /// Poll and process jobs until `shutdown` fires. A job in flight when that
    /// happens runs to completion and is finalized first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(type_prefix = %self.options.type_prefix, "Worker starting");

        while !shutdown.is_cancelled() {
            let delay = match self.process_next_with(&shutdown).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.options.poll_interval,
                Err(e) => {
                    error!(error = %e, "Encountered QueueError");
                    warn!(backoff = ?self.options.error_backoff, "Suspending worker");
                    self.options.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {}
            }
        }

        info!(type_prefix = %self.options.type_prefix, "Worker stopped");
    }

    async fn process_next_with(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobOutcome>, QueueError> {
        let claimed = self
            .queue
            .claim_next(&self.filter, Utc::now(), self.options.lease_duration)
            .await?;
        match claimed {
            Some(job) => self.process(job, shutdown).await.map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts))]
    async fn process(
        &self,
        job: Job,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, QueueError> {
        let log = JobLogger::new(job.id, WORKER_LOG_MODULE, self.log_sink.clone());
        log.info(format!(
            "claimed, attempt {} of {}",
            job.attempts, job.max_attempts
        ))
        .await;

        let result = match self.execute(&job, &log, shutdown).await {
            Ok(()) => {
                self.finalize(&job, self.queue.mark_done(job.id, job.attempts, Utc::now()).await)?
                    .map(|_| JobResult::Completed)
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Error during job processing");
                let decision = self
                    .retry_policy_for(&job)
                    .decide(&job, e.to_string(), e.is_terminal(), Utc::now());
                let finalized = self
                    .queue
                    .mark_failed_or_requeue(job.id, &decision)
                    .await;
                self.finalize(&job, finalized)?.map(|_| match decision {
                    FailureDecision::Requeue {
                        retry_at, error, ..
                    } => JobResult::Requeued { retry_at, error },
                    FailureDecision::Fail { error, .. } => JobResult::Failed { error },
                })
            }
        }
        .unwrap_or(JobResult::LeaseLost);

        match &result {
            JobResult::Completed => log.info("done").await,
            JobResult::Requeued { retry_at, error } => {
                log.warn(format!("requeued for {retry_at}: {error}")).await
            }
            JobResult::Failed { error } => log.error(format!("failed: {error}")).await,
            JobResult::LeaseLost => log.warn("lease lost, outcome discarded").await,
        }

        Ok(JobOutcome {
            job_id: job.id,
            job_type: job.job_type,
            attempts: job.attempts,
            result,
        })
    }

    /// `Ok(None)` when the store says the claim is gone.
    fn finalize(
        &self,
        job: &Job,
        result: Result<(), QueueError>,
    ) -> Result<Option<()>, QueueError> {
        match result {
            Ok(()) => Ok(Some(())),
            Err(QueueError::LeaseLost { .. }) => {
                warn!(job_id = %job.id, "Lease lost before the outcome was recorded");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_policy_for(&self, job: &Job) -> RetryPolicy {
        self.registry
            .get(&job.job_type)
            .and_then(|handler| handler.retry_policy())
            .unwrap_or(self.options.retry_policy)
    }

    /// Run the handler, extending the lease until it returns.
    async fn execute(
        &self,
        job: &Job,
        log: &JobLogger,
        shutdown: &CancellationToken,
    ) -> Result<(), JobError> {
        let handler = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| JobError::UnknownJobType(job.job_type.clone()))?;

        let ctx = JobContext {
            job: job.clone(),
            queue: self.queue.clone(),
            log: log.for_module(job.job_type.clone()),
            shutdown: shutdown.child_token(),
        };
        let handle = async {
            let running = handler.handle(ctx, job.payload.clone());
            match self.options.execution_timeout {
                Some(limit) => tokio::time::timeout(limit, running)
                    .await
                    .unwrap_or_else(|_| Err(JobError::Timeout(limit))),
                None => running.await,
            }
        };
        tokio::pin!(handle);

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut handle => return result,
                _ = heartbeat.tick() => {
                    let until = Utc::now() + self.options.lease_duration;
                    match self.queue.extend_lease(job.id, job.attempts, until).await {
                        Ok(()) => debug!(job_id = %job.id, %until, "Lease extended"),
                        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to extend lease"),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("filter", &self.filter)
            .field("options", &self.options)
            .finish()
    }
}
