//! Shared test specifications for Queue implementations.
//!
//! These test functions can be called by any backend (PostgreSQL, SQLite, memory)
//! to ensure consistent claim, finalize and lease behavior across implementations.

/// Generate all queue spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// // PostgreSQL example with sqlx::test
/// muster::generate_queue_spec_tests! {
///     backend = "pg",
///     test_attr = sqlx::test(migrator = "MIGRATOR"),
///     setup = |pool: PgPool| PgQueue::with_pool(pool)
/// }
///
/// // SQLite example with tokio::test
/// muster::generate_queue_spec_tests! {
///     backend = "sqlite",
///     test_attr = tokio::test,
///     setup = || SqliteQueue::with_pool(make_pool("sqlite::memory:").await.unwrap())
/// }
/// ```
#[macro_export]
macro_rules! generate_queue_spec_tests {
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        setup = |$pool:ident: $pool_type:ty| $setup_expr:expr
    ) => {
        $crate::generate_queue_spec_tests!(@tests $backend, $test_attr, ($pool: $pool_type), $setup_expr);
    };
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        setup = || $setup_expr:expr
    ) => {
        $crate::generate_queue_spec_tests!(@tests $backend, $test_attr, (), $setup_expr);
    };
    (@tests $backend:literal, $test_attr:meta, ($($arg:tt)*), $setup_expr:expr) => {
        $crate::__paste::paste! {
            $crate::generate_queue_spec_tests!(@one [<claim_empty_queue_ $backend>], test_claim_empty_queue, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<enqueue_and_claim_ $backend>], test_enqueue_and_claim, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<claim_is_exclusive_ $backend>], test_claim_is_exclusive, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<not_before_respected_ $backend>], test_not_before_respected, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<priority_ordering_ $backend>], test_priority_ordering, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<same_priority_first_scheduled_first_ $backend>], test_same_priority_first_scheduled_first, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<prefix_filtering_ $backend>], test_prefix_filtering, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<prefix_wildcards_are_literal_ $backend>], test_prefix_wildcards_are_literal, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<job_type_filter_ $backend>], test_job_type_filter, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<mark_done_is_terminal_ $backend>], test_mark_done_is_terminal, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<retry_ceiling_ $backend>], test_retry_ceiling, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<requeue_respects_retry_at_ $backend>], test_requeue_respects_retry_at, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<finalize_is_fenced_ $backend>], test_finalize_is_fenced, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<reap_requeues_expired_lease_ $backend>], test_reap_requeues_expired_lease, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<reap_fails_exhausted_job_ $backend>], test_reap_fails_exhausted_job, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<extend_lease_defers_reap_ $backend>], test_extend_lease_defers_reap, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<stats_by_prefix_ $backend>], test_stats_by_prefix, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<get_job_ $backend>], test_get_job, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<invalid_job_rejected_ $backend>], test_invalid_job_rejected, $test_attr, ($($arg)*), $setup_expr);
            $crate::generate_queue_spec_tests!(@one [<concurrent_claims_are_exclusive_ $backend>], test_concurrent_claims_are_exclusive, $test_attr, ($($arg)*), $setup_expr);
        }
    };
    (@one $name:ident, $spec:ident, $test_attr:meta, ($($arg:tt)*), $setup_expr:expr) => {
        #[$test_attr]
        async fn $name($($arg)*) {
            let queue = $setup_expr;
            $crate::queue_spec::$spec(queue).await;
        }
    };
}

use crate::core::{
    job::{JobStatus, NewJob},
    queue::{ClaimFilter, EnqueueOptions, Queue, QueueError},
    retry::FailureDecision,
    DateTime, Duration, Utc,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn lease() -> Duration {
    Duration::seconds(30)
}

fn new_job(job_type: &str, options: EnqueueOptions) -> NewJob {
    NewJob::new(job_type, json!({"memory_id": 42}), options)
}

/// Backends store timestamps with millisecond (SQLite) or microsecond (Postgres)
/// precision; compare at millisecond granularity.
fn assert_close(actual: Option<DateTime>, expected: DateTime) {
    let actual = actual.expect("timestamp should be set");
    let diff = (actual - expected).num_milliseconds().abs();
    assert!(diff <= 1, "expected {expected}, got {actual}");
}

fn any() -> ClaimFilter {
    ClaimFilter::prefix("")
}

/// Claiming from an empty queue returns `None`.
pub async fn test_claim_empty_queue<Q: Queue>(queue: Q) {
    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap();
    assert!(job.is_none());
}

/// An enqueued job is claimed once, with its attempt counter and lease set.
pub async fn test_enqueue_and_claim<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::now().with_priority(5),
        ))
        .await
        .unwrap();

    let queued = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.attempts, 0);
    assert_eq!(queued.payload, json!({"memory_id": 42}));

    let now = Utc::now();
    let job = queue
        .claim_next(&ClaimFilter::prefix("memory."), now, lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, jid);
    assert_eq!(job.job_type, "memory.ingest");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.priority, 5);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.payload, json!({"memory_id": 42}));
    assert_close(job.started_at, now);
    assert_close(job.lease_expires_at, now + lease());

    queue.mark_done(jid, job.attempts, Utc::now()).await.unwrap();
    let done = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.finished_at.is_some());
    assert!(done.lease_expires_at.is_none());
}

/// A running job is not handed out again.
pub async fn test_claim_is_exclusive<Q: Queue>(queue: Q) {
    queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();

    let first = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap();
    assert!(first.is_some());
    let second = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap();
    assert!(second.is_none());
}

/// A job scheduled in the future is invisible until its time comes.
pub async fn test_not_before_respected<Q: Queue>(queue: Q) {
    let now = Utc::now();
    let later = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(now + Duration::seconds(60)),
        ))
        .await
        .unwrap();

    assert!(queue.claim_next(&any(), now, lease()).await.unwrap().is_none());
    assert!(queue
        .claim_next(&any(), now + Duration::seconds(59), lease())
        .await
        .unwrap()
        .is_none());

    let hour_ago = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(now - Duration::hours(1)),
        ))
        .await
        .unwrap();
    let job = queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();
    assert_eq!(job.id, hour_ago);

    let job = queue
        .claim_next(&any(), now + Duration::seconds(61), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, later);
}

/// Lower priority values are served first.
pub async fn test_priority_ordering<Q: Queue>(queue: Q) {
    let at = Utc::now() - Duration::minutes(1);
    let low = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(at).with_priority(10),
        ))
        .await
        .unwrap();
    let high = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(at).with_priority(1),
        ))
        .await
        .unwrap();

    let first = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();
    assert_eq!(first.id, high);
    let second = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();
    assert_eq!(second.id, low);
}

/// Within a priority tier the earliest `scheduled_at` wins.
pub async fn test_same_priority_first_scheduled_first<Q: Queue>(queue: Q) {
    let now = Utc::now();
    let newer = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(now - Duration::minutes(1)),
        ))
        .await
        .unwrap();
    let older = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::new().at(now - Duration::minutes(5)),
        ))
        .await
        .unwrap();

    let first = queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();
    assert_eq!(first.id, older);
    let second = queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();
    assert_eq!(second.id, newer);
}

/// Workers only see job types under their prefix.
pub async fn test_prefix_filtering<Q: Queue>(queue: Q) {
    let events = queue
        .enqueue(new_job("events.normalize", EnqueueOptions::now()))
        .await
        .unwrap();
    let memory = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();

    let job = queue
        .claim_next(&ClaimFilter::prefix("memory."), Utc::now(), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, memory);
    assert!(queue
        .claim_next(&ClaimFilter::prefix("memory."), Utc::now(), lease())
        .await
        .unwrap()
        .is_none());

    let job = queue
        .claim_next(&ClaimFilter::prefix("events."), Utc::now(), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, events);
}

/// `_` in a prefix matches only itself, not any character.
pub async fn test_prefix_wildcards_are_literal<Q: Queue>(queue: Q) {
    queue
        .enqueue(new_job("memoryx.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let underscored = queue
        .enqueue(new_job("memory_.ingest", EnqueueOptions::now().with_priority(1)))
        .await
        .unwrap();

    let filter = ClaimFilter::prefix("memory_");
    let job = queue
        .claim_next(&filter, Utc::now(), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, underscored);
    assert!(queue
        .claim_next(&filter, Utc::now(), lease())
        .await
        .unwrap()
        .is_none());
}

/// A filter naming job types skips other types under the same prefix.
pub async fn test_job_type_filter<Q: Queue>(queue: Q) {
    queue
        .enqueue(new_job("memory.compact", EnqueueOptions::now().with_priority(-5)))
        .await
        .unwrap();
    let ingest = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();

    let filter = ClaimFilter::prefix("memory.").with_job_types(["memory.ingest"]);
    let job = queue
        .claim_next(&filter, Utc::now(), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, ingest);
    assert!(queue
        .claim_next(&filter, Utc::now(), lease())
        .await
        .unwrap()
        .is_none());
}

/// Done jobs are never claimed again.
pub async fn test_mark_done_is_terminal<Q: Queue>(queue: Q) {
    queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();
    queue.mark_done(job.id, job.attempts, Utc::now()).await.unwrap();

    let far_future = Utc::now() + Duration::days(365);
    assert!(queue
        .claim_next(&any(), far_future, lease())
        .await
        .unwrap()
        .is_none());
    assert!(queue.reap_expired(far_future, 100).await.unwrap().is_empty());
}

/// With `max_attempts = 2`, the second failure is terminal.
pub async fn test_retry_ceiling<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::now().with_max_attempts(2),
        ))
        .await
        .unwrap();

    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let now = Utc::now();
    queue
        .mark_failed_or_requeue(
            jid,
            &FailureDecision::Requeue {
                attempts: 1,
                error: "first failure".to_string(),
                retry_at: now,
            },
        )
        .await
        .unwrap();
    let requeued = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.error_text.as_deref(), Some("first failure"));
    assert!(requeued.finished_at.is_none());

    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    let finished_at = Utc::now();
    queue
        .mark_failed_or_requeue(
            jid,
            &FailureDecision::Fail {
                attempts: 2,
                error: "second failure".to_string(),
                finished_at,
            },
        )
        .await
        .unwrap();

    let failed = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.error_text.as_deref(), Some("second failure"));
    assert_close(failed.finished_at, finished_at);
    assert!(queue
        .claim_next(&any(), Utc::now() + Duration::days(1), lease())
        .await
        .unwrap()
        .is_none());
}

/// A requeued job waits until its `retry_at`.
pub async fn test_requeue_respects_retry_at<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();

    let now = Utc::now();
    let retry_at = now + Duration::seconds(4);
    queue
        .mark_failed_or_requeue(
            jid,
            &FailureDecision::Requeue {
                attempts: job.attempts,
                error: "try later".to_string(),
                retry_at,
            },
        )
        .await
        .unwrap();

    assert!(queue.claim_next(&any(), now, lease()).await.unwrap().is_none());
    let job = queue
        .claim_next(&any(), retry_at + Duration::milliseconds(1), lease())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, jid);
    assert_eq!(job.attempts, 2);
}

/// Finalizing twice, or with the wrong attempt, reports `LeaseLost`.
pub async fn test_finalize_is_fenced<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let job = queue.claim_next(&any(), Utc::now(), lease()).await.unwrap().unwrap();

    let wrong_attempt = queue.mark_done(jid, job.attempts + 1, Utc::now()).await;
    assert!(matches!(wrong_attempt, Err(QueueError::LeaseLost { .. })));

    queue.mark_done(jid, job.attempts, Utc::now()).await.unwrap();
    let twice = queue.mark_done(jid, job.attempts, Utc::now()).await;
    assert!(matches!(twice, Err(QueueError::LeaseLost { .. })));

    let after_done = queue
        .mark_failed_or_requeue(
            jid,
            &FailureDecision::Fail {
                attempts: job.attempts,
                error: "late".to_string(),
                finished_at: Utc::now(),
            },
        )
        .await;
    assert!(matches!(after_done, Err(QueueError::LeaseLost { .. })));
    assert_eq!(
        queue.get_job(jid).await.unwrap().unwrap().status,
        JobStatus::Done
    );

    let unknown = queue.mark_done(Uuid::now_v7(), 1, Utc::now()).await;
    assert!(matches!(unknown, Err(QueueError::LeaseLost { .. })));
}

/// An expired lease puts the job back in the queue; the stale holder loses it.
pub async fn test_reap_requeues_expired_lease<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let now = Utc::now();
    let stale = queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();

    assert!(queue.reap_expired(now, 100).await.unwrap().is_empty());

    let later = now + lease() + Duration::seconds(1);
    let reaped = queue.reap_expired(later, 100).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, jid);
    assert_eq!(reaped[0].status, JobStatus::Queued);
    assert_eq!(reaped[0].attempts, 1);

    let requeued = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.error_text.as_deref(), Some("lease expired"));

    let fresh = queue.claim_next(&any(), later, lease()).await.unwrap().unwrap();
    assert_eq!(fresh.id, jid);
    assert_eq!(fresh.attempts, 2);

    let stale_done = queue.mark_done(jid, stale.attempts, later).await;
    assert!(matches!(stale_done, Err(QueueError::LeaseLost { .. })));
    queue.mark_done(jid, fresh.attempts, later).await.unwrap();
}

/// A job whose last attempt's lease expires ends as failed.
pub async fn test_reap_fails_exhausted_job<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::now().with_max_attempts(1),
        ))
        .await
        .unwrap();
    let now = Utc::now();
    queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();

    let reaped = queue
        .reap_expired(now + lease() + Duration::seconds(1), 100)
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].status, JobStatus::Failed);

    let failed = queue.get_job(jid).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.finished_at.is_some());
}

/// Heartbeats push the lease out of the reaper's reach.
pub async fn test_extend_lease_defers_reap<Q: Queue>(queue: Q) {
    let jid = queue
        .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
        .await
        .unwrap();
    let now = Utc::now();
    let job = queue.claim_next(&any(), now, lease()).await.unwrap().unwrap();

    let extended = now + Duration::minutes(10);
    queue.extend_lease(jid, job.attempts, extended).await.unwrap();
    assert_close(
        queue.get_job(jid).await.unwrap().unwrap().lease_expires_at,
        extended,
    );

    assert!(queue
        .reap_expired(now + lease() + Duration::seconds(1), 100)
        .await
        .unwrap()
        .is_empty());

    let stale = queue.extend_lease(jid, job.attempts + 1, extended).await;
    assert!(matches!(stale, Err(QueueError::LeaseLost { .. })));
}

/// Stats count jobs per status under a prefix.
pub async fn test_stats_by_prefix<Q: Queue>(queue: Q) {
    for _ in 0..3 {
        queue
            .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
            .await
            .unwrap();
    }
    queue
        .enqueue(new_job("events.normalize", EnqueueOptions::now()))
        .await
        .unwrap();

    let filter = ClaimFilter::prefix("memory.");
    let done = queue.claim_next(&filter, Utc::now(), lease()).await.unwrap().unwrap();
    queue.mark_done(done.id, done.attempts, Utc::now()).await.unwrap();
    queue.claim_next(&filter, Utc::now(), lease()).await.unwrap().unwrap();

    let stats = queue.stats("memory.").await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.done, 1);
    assert_eq!(stats.failed, 0);

    let all = queue.stats("").await.unwrap();
    assert_eq!(all.total(), 4);
    assert_eq!(all.queued, 2);
}

/// Unknown ids read as `None`.
pub async fn test_get_job<Q: Queue>(queue: Q) {
    assert!(queue.get_job(Uuid::now_v7()).await.unwrap().is_none());
}

/// Malformed jobs never reach the store.
pub async fn test_invalid_job_rejected<Q: Queue>(queue: Q) {
    let result = queue.enqueue(new_job("", EnqueueOptions::now())).await;
    assert!(matches!(result, Err(QueueError::InvalidJob(_))));

    let result = queue
        .enqueue(new_job(
            "memory.ingest",
            EnqueueOptions::now().with_max_attempts(0),
        ))
        .await;
    assert!(matches!(result, Err(QueueError::InvalidJob(_))));
    assert_eq!(queue.stats("").await.unwrap().total(), 0);
}

/// Concurrent claimers never receive the same job and drain the queue.
pub async fn test_concurrent_claims_are_exclusive<Q: Queue + 'static>(queue: Q) {
    const JOBS: usize = 100;
    const CLAIMERS: usize = 5;

    let queue = Arc::new(queue);
    for _ in 0..JOBS {
        queue
            .enqueue(new_job("memory.ingest", EnqueueOptions::now()))
            .await
            .unwrap();
    }

    let claimers = (0..CLAIMERS).map(|_| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue
                .claim_next(&ClaimFilter::prefix("memory."), Utc::now(), lease())
                .await
                .unwrap()
            {
                queue.mark_done(job.id, job.attempts, Utc::now()).await.unwrap();
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        })
    });

    let results = futures::future::join_all(claimers).await;
    let claimed: Vec<Uuid> = results
        .into_iter()
        .flat_map(|r| r.expect("claimer panicked"))
        .collect();
    let distinct: HashSet<Uuid> = claimed.iter().copied().collect();

    assert_eq!(claimed.len(), JOBS, "every job claimed exactly once");
    assert_eq!(distinct.len(), JOBS);
    assert_eq!(queue.stats("memory.").await.unwrap().done, JOBS as u64);
}
