#![doc = include_str!("../README.md")]

pub mod core;
pub mod dispatcher;
pub mod memory;

/// Shared test specifications for backend implementations.
///
/// These test functions ensure consistent behavior across all Queue implementations
/// (PostgreSQL, SQLite, memory). Backend tests should call these functions with their
/// queue instance, usually through [`generate_queue_spec_tests!`].
#[doc(hidden)]
pub mod queue_spec;

#[doc(hidden)]
pub use paste as __paste;

/// Default implementation of the worker loop and its collaborators.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod reaper;
    pub mod registry;
    pub mod worker;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        elector::{AlwaysLeader, Elector, NeverLeader},
        job::{Job, JobStatus, NewJob},
        job_processor::{JobContext, JobError, JobProcessor},
        job_type::JobType,
        log_sink::{JobLogger, LogLevel, LogSink},
        queue::{ClaimFilter, EnqueueOptions, Queue, QueueError, QueueExt},
        retry::{Backoff, FailureDecision, RetryPolicy},
        CancellationToken, Duration, Uuid,
    };
    pub use super::dispatcher::{Dispatcher, EnqueueRequest, EnqueueResponse};
    #[cfg(feature = "runner")]
    pub use super::runner::{
        reaper::{LeaseReaper, ReaperOptions},
        registry::HandlerRegistry,
        worker::{Worker, WorkerOptions},
    };
    pub use serde::{Deserialize, Serialize};
}
