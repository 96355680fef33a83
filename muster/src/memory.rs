//! In-process queue and log sink.
//!
//! Holds every job in a mutex-guarded map, so claims are trivially exclusive
//! within one process. Meant for tests and for exercising handlers without a
//! database; it is not durable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::core::job::{Job, JobStatus, NewJob};
use crate::core::log_sink::{LogEntry, LogSink, LogSinkError};
use crate::core::queue::{ClaimFilter, Queue, QueueError, QueueStats, ReapedJob};
use crate::core::retry::FailureDecision;
use crate::core::{DateTime, Duration, Utc};

pub(crate) const LEASE_EXPIRED: &str = "lease expired";

/// A [`Queue`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every job, in no particular order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::DatabaseError(anyhow::anyhow!(
                "memory queue is unavailable"
            )));
        }
        Ok(())
    }

    fn with_held_job<T>(
        &self,
        job_id: Uuid,
        attempts: u32,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, QueueError> {
        self.check_available()?;
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.attempts == attempts => Ok(f(job)),
            _ => Err(QueueError::lease_lost(job_id, attempts)),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        self.check_available()?;
        job.validate()?;
        let id = job.id;
        self.lock().insert(id, job.into_job(Utc::now()));
        Ok(id)
    }

    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        now: DateTime,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        let mut jobs = self.lock();
        let next = jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.scheduled_at <= now
                    && filter.matches(&job.job_type)
            })
            .min_by_key(|job| (job.priority, job.scheduled_at, job.created_at, job.id))
            .map(|job| job.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.attempts += 1;
            job.lease_expires_at = Some(now + lease);
            job.clone()
        }))
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        attempts: u32,
        now: DateTime,
    ) -> Result<(), QueueError> {
        self.with_held_job(job_id, attempts, |job| {
            job.status = JobStatus::Done;
            job.finished_at = Some(now);
            job.lease_expires_at = None;
        })
    }

    async fn mark_failed_or_requeue(
        &self,
        job_id: Uuid,
        decision: &FailureDecision,
    ) -> Result<(), QueueError> {
        self.with_held_job(job_id, decision.attempts(), |job| {
            job.lease_expires_at = None;
            job.error_text = Some(decision.error().to_string());
            match decision {
                FailureDecision::Requeue { retry_at, .. } => {
                    job.status = JobStatus::Queued;
                    job.scheduled_at = *retry_at;
                }
                FailureDecision::Fail { finished_at, .. } => {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(*finished_at);
                }
            }
        })
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        attempts: u32,
        until: DateTime,
    ) -> Result<(), QueueError> {
        self.with_held_job(job_id, attempts, |job| {
            job.lease_expires_at = Some(until);
        })
    }

    async fn reap_expired(
        &self,
        now: DateTime,
        limit: usize,
    ) -> Result<Vec<ReapedJob>, QueueError> {
        self.check_available()?;
        let mut jobs = self.lock();
        let mut expired: Vec<(DateTime, Uuid)> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter_map(|job| {
                job.lease_expires_at
                    .filter(|expires| *expires < now)
                    .map(|expires| (expires, job.id))
            })
            .collect();
        expired.sort_unstable();
        expired.truncate(limit);

        let reaped = expired
            .into_iter()
            .filter_map(|(_, id)| {
                let job = jobs.get_mut(&id)?;
                job.lease_expires_at = None;
                job.error_text = Some(LEASE_EXPIRED.to_string());
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(now);
                } else {
                    job.status = JobStatus::Queued;
                    job.scheduled_at = now;
                }
                Some(ReapedJob {
                    id: job.id,
                    job_type: job.job_type.clone(),
                    attempts: job.attempts,
                    status: job.status,
                })
            })
            .collect();
        Ok(reaped)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.check_available()?;
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn stats(&self, prefix: &str) -> Result<QueueStats, QueueError> {
        self.check_available()?;
        let mut stats = QueueStats::default();
        for job in self.lock().values() {
            if job.job_type.starts_with(prefix) {
                stats.add(job.status, 1);
            }
        }
        Ok(stats)
    }
}

/// A [`LogSink`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries of one job, in append order.
    pub fn job_logs(&self, job_id: Uuid) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.job_id == job_id)
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), LogSinkError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::generate_queue_spec_tests! {
        backend = "memory",
        test_attr = tokio::test,
        setup = || MemoryQueue::new()
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let queue = MemoryQueue::new();
        queue.set_unavailable(true);
        let result = queue
            .claim_next(&ClaimFilter::prefix(""), Utc::now(), Duration::seconds(30))
            .await;
        assert!(matches!(result, Err(QueueError::DatabaseError(_))));

        queue.set_unavailable(false);
        let result = queue
            .claim_next(&ClaimFilter::prefix(""), Utc::now(), Duration::seconds(30))
            .await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn reap_takes_oldest_lease_first() {
        use crate::core::queue::EnqueueOptions;

        let queue = MemoryQueue::new();
        let mut by_lease = Vec::new();
        for minutes in [-1, -3, -2] {
            queue
                .enqueue(NewJob::new(
                    "memory.ingest",
                    serde_json::json!({}),
                    EnqueueOptions::now(),
                ))
                .await
                .unwrap();
            let job = queue
                .claim_next(
                    &ClaimFilter::prefix("memory."),
                    Utc::now(),
                    Duration::minutes(minutes),
                )
                .await
                .unwrap()
                .unwrap();
            by_lease.push((minutes, job.id));
        }
        by_lease.sort();
        let now = Utc::now();

        for (_, id) in by_lease {
            let reaped = queue.reap_expired(now, 1).await.unwrap();
            assert_eq!(reaped.len(), 1);
            assert_eq!(reaped[0].id, id);
        }
        assert!(queue.reap_expired(now, 1).await.unwrap().is_empty());
    }
}
