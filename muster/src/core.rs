//! Implementation agnostic traits for implementing queues and re-exports of 3rd party types/crates used in public interface.

pub use uuid::Uuid;

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::{Duration, Utc};
pub use serde_json;
pub use tokio_util::sync::CancellationToken;

pub mod elector;
pub mod job;
pub mod job_processor;
pub mod job_type;
pub mod log_sink;
pub mod queue;
pub mod retry;
