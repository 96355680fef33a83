//! What happens to a job after a failed attempt.

use serde::{Deserialize, Serialize};

use crate::core::job::Job;
use crate::core::{DateTime, Duration};

/// Delay before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Requeue with `scheduled_at = now`.
    Immediate,
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failure of attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Immediate => Duration::zero(),
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(62);
                let factor = 1i64 << exponent;
                let base_ms = base.num_milliseconds();
                let delay_ms = base_ms.saturating_mul(factor);
                Duration::milliseconds(delay_ms.min(max.num_milliseconds()))
            }
        }
    }
}

/// Retry behaviour applied by the worker when a handler fails.
///
/// The attempt ceiling itself lives on the job (`max_attempts`); the policy only
/// decides how long a requeued job waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Requeue failed jobs without delay.
    pub fn immediate() -> Self {
        Self {
            backoff: Backoff::Immediate,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Decide the outcome of a failed attempt of `job`.
    ///
    /// `terminal` forces a failure regardless of the remaining attempts.
    pub fn decide(
        &self,
        job: &Job,
        error: impl Into<String>,
        terminal: bool,
        now: DateTime,
    ) -> FailureDecision {
        let error = error.into();
        if terminal || job.attempts >= job.max_attempts {
            FailureDecision::Fail {
                attempts: job.attempts,
                error,
                finished_at: now,
            }
        } else {
            FailureDecision::Requeue {
                attempts: job.attempts,
                error,
                retry_at: now + self.backoff.delay(job.attempts),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Exponential backoff starting at 2 seconds, capped at one hour.
    fn default() -> Self {
        Self::exponential(Duration::seconds(2), Duration::hours(1))
    }
}

/// The outcome of a failed attempt, applied by [`crate::core::queue::Queue::mark_failed_or_requeue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureDecision {
    /// Back to `queued`, eligible again at `retry_at`.
    Requeue {
        attempts: u32,
        error: String,
        retry_at: DateTime,
    },
    /// Terminal `failed`.
    Fail {
        attempts: u32,
        error: String,
        finished_at: DateTime,
    },
}

impl FailureDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            FailureDecision::Requeue { attempts, .. } | FailureDecision::Fail { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &str {
        match self {
            FailureDecision::Requeue { error, .. } | FailureDecision::Fail { error, .. } => error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureDecision::Fail { .. })
    }
}
