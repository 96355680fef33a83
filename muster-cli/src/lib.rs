//! Process bootstrap for muster on PostgreSQL: configuration, logging and the
//! long-running worker and reaper tasks.
//!
//! The `muster` binary only operates the queue. Applications that process jobs
//! build a [`HandlerRegistry`] and hand it to [`run_worker`]:
//!
//! ```no_run
//! use clap::Parser;
//! use muster::prelude::*;
//! use muster_cli::config::WorkerConfig;
//!
//! #[derive(Parser)]
//! struct Args {
//!     #[command(flatten)]
//!     worker: WorkerConfig,
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let args = Args::parse();
//! let registry = HandlerRegistry::default();
//! // registry.register(MyJob)?;
//! muster_cli::run_worker(args.worker, registry).await
//! # }
//! ```

pub mod config;
pub mod logging;

use anyhow::Context;
use config::{DatabaseArgs, WorkerConfig};
use muster::core::elector::Elector;
use muster::core::log_sink::LogSink;
use muster::core::queue::Queue;
use muster::core::CancellationToken;
use muster::runner::reaper::LeaseReaper;
use muster::runner::registry::HandlerRegistry;
use muster::runner::worker::Worker;
use muster_postgres::{PgAdvisoryLockElector, PgLogSink, PgQueue};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

pub use logging::init_tracing;

pub async fn connect(database: &DatabaseArgs) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(&database.database_url)
        .await
        .context("Failed to connect to PostgreSQL")
}

/// Cancel `shutdown` on Ctrl-C.
pub fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });
}

/// Serve `config.type_prefix` from PostgreSQL until Ctrl-C.
///
/// Runs `config.workers` worker loops and one reaper gated by an advisory lock.
pub async fn run_worker(config: WorkerConfig, registry: HandlerRegistry) -> anyhow::Result<()> {
    let pool = connect(&config.database).await?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::with_pool(pool.clone()));
    let log_sink: Arc<dyn LogSink> = Arc::new(PgLogSink::with_pool(pool.clone()));
    let elector: Box<dyn Elector> = Box::new(PgAdvisoryLockElector::new(pool));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    run_workers(
        queue,
        Arc::new(registry),
        log_sink,
        Some(elector),
        &config,
        shutdown,
    )
    .await
}

/// Run worker loops and the lease reaper against `queue` until `shutdown` fires,
/// then wait for in-flight jobs to finish.
pub async fn run_workers(
    queue: Arc<dyn Queue>,
    registry: Arc<HandlerRegistry>,
    log_sink: Arc<dyn LogSink>,
    elector: Option<Box<dyn Elector>>,
    config: &WorkerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let options = config
        .worker_options()
        .context("Invalid worker configuration")?;
    let reaper = LeaseReaper::new(queue.clone(), elector, config.reaper_options())
        .context("Invalid reaper configuration")?;
    let mut tasks = JoinSet::new();

    for index in 0..config.workers.max(1) {
        let worker = Worker::new(queue.clone(), registry.clone(), options.clone())
            .context("Invalid worker configuration")?
            .with_log_sink(log_sink.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            worker.run(shutdown).await;
            info!(worker = index, "Worker loop exited");
            Ok(())
        });
    }

    let reaper_shutdown = shutdown.clone();
    tasks.spawn(async move {
        reaper
            .run_with_shutdown(async move { reaper_shutdown.cancelled().await })
            .await
    });

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("Background task panicked")
            .and_then(|outcome| outcome);
        if let Err(e) = outcome {
            error!(error = ?e, "Background task failed");
            shutdown.cancel();
            result = Err(e);
        }
    }
    result
}
