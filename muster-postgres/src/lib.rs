//! PostgreSQL implementation of the Queue and LogSink traits from muster

pub mod elector;
pub mod log_sink;
pub mod queue;
mod types;

pub use elector::PgAdvisoryLockElector;
pub use log_sink::PgLogSink;
pub use queue::PgQueue;
use sqlx::migrate::Migrator;
pub static MIGRATOR: Migrator = sqlx::migrate!();

#[cfg(all(test, feature = "integration-tests"))]
mod test {
    use crate::{PgAdvisoryLockElector, PgLogSink, PgQueue, MIGRATOR};
    use muster::core::elector::Elector;
    use muster::core::log_sink::{JobLogger, LogLevel};
    use muster::prelude::*;
    use muster::runner::worker::JobResult;
    use sqlx::PgPool;
    use std::sync::Arc;

    #[allow(dead_code)]
    pub fn setup_logger() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .init();
    }

    #[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
    struct IngestPayload {
        memory_id: i64,
    }

    struct Ingest;

    impl JobType for Ingest {
        fn job_type() -> &'static str {
            "memory.ingest"
        }
    }

    #[async_trait::async_trait]
    impl JobProcessor for Ingest {
        type Payload = IngestPayload;
        type Error = anyhow::Error;

        async fn handle(&self, ctx: JobContext, payload: Self::Payload) -> anyhow::Result<()> {
            ctx.log
                .info(format!("ingesting {}", payload.memory_id))
                .await;
            Ok(())
        }
    }

    muster::generate_queue_spec_tests! {
        backend = "pg",
        test_attr = sqlx::test(migrator = "MIGRATOR"),
        setup = |pool: PgPool| PgQueue::with_pool(pool)
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn log_sink_round_trip(pool: PgPool) {
        let queue = PgQueue::with_pool(pool.clone());
        let sink = Arc::new(PgLogSink::with_pool(pool));
        let job_id = queue
            .schedule::<Ingest>(IngestPayload { memory_id: 1 }, EnqueueOptions::now())
            .await
            .unwrap();

        let log = JobLogger::new(job_id, "tests", sink.clone());
        log.info("first").await;
        log.error("second").await;

        let entries = sink.job_logs(job_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].message, "second");
        assert_eq!(entries[1].level, LogLevel::Error);
        assert!(entries.iter().all(|e| e.module == "tests"));
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn worker_end_to_end(pool: PgPool) {
        let queue: Arc<dyn Queue> = Arc::new(PgQueue::with_pool(pool.clone()));
        let sink = Arc::new(PgLogSink::with_pool(pool));
        let mut registry = HandlerRegistry::default();
        registry.register(Ingest).unwrap();

        let job_id = queue
            .schedule::<Ingest>(
                IngestPayload { memory_id: 42 },
                EnqueueOptions::now().with_priority(5),
            )
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), Arc::new(registry), WorkerOptions::new("memory."))
            .unwrap()
            .with_log_sink(sink.clone());
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome.job_id, job_id);
        assert_eq!(outcome.result, JobResult::Completed);

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(sink
            .job_logs(job_id)
            .await
            .unwrap()
            .iter()
            .any(|e| e.message == "ingesting 42"));
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn advisory_lock_has_one_leader(pool: PgPool) {
        let first = PgAdvisoryLockElector::with_key(pool.clone(), 42);
        let second = PgAdvisoryLockElector::with_key(pool, 42);

        assert!(first.is_leader().await.unwrap());
        assert!(first.is_leader().await.unwrap());
        assert!(!second.is_leader().await.unwrap());

        first.release_leadership().await.unwrap();
        assert!(second.is_leader().await.unwrap());
        assert!(!first.is_leader().await.unwrap());
    }
}
