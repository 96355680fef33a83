//! Background service recovering jobs whose worker went away.
//!
//! A job stays `running` for as long as its lease is renewed. When a worker dies
//! mid-job the heartbeat stops, the lease runs out, and the reaper hands the job
//! back to the queue (or fails it when no attempts are left). Only one instance
//! needs to reap; pass an [`Elector`] to gate it in multi-instance deployments.

use crate::core::elector::Elector;
use crate::core::job::JobStatus;
use crate::core::queue::{Queue, ReapedJob};
use crate::core::Utc;
use anyhow::Context;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Options for configuring the lease reaper.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ReaperOptions {
    /// How often to look for expired leases (default: 30 seconds)
    pub interval: Duration,

    /// Maximum number of jobs recovered per tick (default: 100)
    pub batch_size: usize,
}

impl Default for ReaperOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl ReaperOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Errors returned when building a reaper.
#[derive(Error, Debug)]
pub enum ReaperError {
    #[error("Invalid reaper options: {0}")]
    InvalidOptions(String),
}

/// Periodically recovers running jobs with an expired lease.
///
/// # Example
///
/// ```rust,no_run
/// use muster::core::elector::AlwaysLeader;
/// use muster::memory::MemoryQueue;
/// use muster::runner::reaper::{LeaseReaper, ReaperOptions};
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let reaper = LeaseReaper::new(
///     Arc::new(MemoryQueue::new()),
///     Some(Box::new(AlwaysLeader)),
///     ReaperOptions::default(),
/// )?;
///
/// // Run until shutdown signal
/// let shutdown = async {
///     let _ = tokio::signal::ctrl_c().await;
/// };
/// reaper.run_with_shutdown(shutdown).await?;
/// # Ok(())
/// # }
/// ```
pub struct LeaseReaper {
    queue: Arc<dyn Queue>,
    elector: Option<Box<dyn Elector>>,
    options: ReaperOptions,
}

impl LeaseReaper {
    /// Create a new reaper. Fails when the interval is zero.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue to recover jobs in
    /// * `elector` - Optional leader elector. If None, always reaps.
    /// * `options` - Reaper configuration options
    pub fn new(
        queue: Arc<dyn Queue>,
        elector: Option<Box<dyn Elector>>,
        options: ReaperOptions,
    ) -> Result<Self, ReaperError> {
        if options.interval.is_zero() {
            return Err(ReaperError::InvalidOptions(
                "interval must be positive".to_string(),
            ));
        }

        info!(
            interval = ?options.interval,
            batch_size = options.batch_size,
            has_elector = elector.is_some(),
            "Initializing lease reaper"
        );

        Ok(Self {
            queue,
            elector,
            options,
        })
    }

    /// Run the reaper. This method blocks forever.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the reaper until the shutdown future completes. Leadership is released
    /// on the way out.
    pub async fn run_with_shutdown<F>(&self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()>,
    {
        info!("Lease reaper starting");

        let mut interval = tokio::time::interval(self.options.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Error reaping expired leases");
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping lease reaper");
                    break;
                }
            }
        }

        if let Some(elector) = &self.elector {
            elector
                .release_leadership()
                .await
                .context("Failed to release leadership")?;
        }

        info!("Lease reaper stopped");
        Ok(())
    }

    /// One reaper tick. Returns the recovered jobs; empty when this instance is
    /// not the leader.
    #[instrument(skip(self), fields(is_leader, jobs_reaped))]
    pub async fn reap_once(&self) -> Result<Vec<ReapedJob>, anyhow::Error> {
        let is_leader = match &self.elector {
            Some(elector) => elector
                .is_leader()
                .await
                .context("Failed to check leader status")?,
            None => true,
        };

        tracing::Span::current().record("is_leader", is_leader);

        if !is_leader {
            debug!("Not the leader, skipping reap");
            return Ok(Vec::new());
        }

        let reaped = self
            .queue
            .reap_expired(Utc::now(), self.options.batch_size)
            .await
            .context("Failed to reap expired leases")?;

        tracing::Span::current().record("jobs_reaped", reaped.len());

        for job in &reaped {
            match job.status {
                JobStatus::Failed => warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "Lease expired on last attempt, job failed"
                ),
                _ => info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "Lease expired, job requeued"
                ),
            }
        }

        Ok(reaped)
    }
}
