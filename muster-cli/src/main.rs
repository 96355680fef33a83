use anyhow::Context;
use clap::Parser;
use muster::core::queue::Queue;
use muster::core::CancellationToken;
use muster::dispatcher::{Dispatcher, EnqueueRequest};
use muster::runner::reaper::LeaseReaper;
use muster_cli::config::{Cli, Command, DatabaseArgs, EnqueueArgs, ReapArgs};
use muster_cli::{cancel_on_ctrl_c, connect, init_tracing};
use muster_postgres::{PgAdvisoryLockElector, PgQueue, MIGRATOR};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Migrate(database) => migrate(&database).await,
        Command::Enqueue(args) => enqueue(args).await,
        Command::Stats { database, prefix } => stats(&database, &prefix).await,
        Command::Job { database, id } => show_job(&database, id).await,
        Command::Reap(args) => reap(args).await,
    }
}

async fn queue(database: &DatabaseArgs) -> anyhow::Result<PgQueue> {
    Ok(PgQueue::with_pool(connect(database).await?))
}

async fn migrate(database: &DatabaseArgs) -> anyhow::Result<()> {
    let pool = connect(database).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Migrations applied");
    Ok(())
}

async fn enqueue(args: EnqueueArgs) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(Arc::new(queue(&args.database).await?));
    let request = EnqueueRequest {
        job_type: Some(args.job_type),
        payload: Some(args.payload),
        priority: Some(args.priority),
        run_at: args.run_at,
        max_attempts: args.max_attempts,
    };

    let (status, response) = dispatcher.respond(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if status != 200 {
        anyhow::bail!("Enqueue rejected with status {status}");
    }
    Ok(())
}

async fn stats(database: &DatabaseArgs, prefix: &str) -> anyhow::Result<()> {
    let stats = queue(database).await?.stats(prefix).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn show_job(database: &DatabaseArgs, id: Uuid) -> anyhow::Result<()> {
    let job = queue(database)
        .await?
        .get_job(id)
        .await?
        .with_context(|| format!("Job {id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn reap(args: ReapArgs) -> anyhow::Result<()> {
    let pool = connect(&args.database).await?;
    let reaper = LeaseReaper::new(
        Arc::new(PgQueue::with_pool(pool.clone())),
        Some(Box::new(PgAdvisoryLockElector::new(pool))),
        args.reaper_options(),
    )
    .context("Invalid reaper configuration")?;

    if args.once {
        let reaped = reaper.reap_once().await?;
        println!("{}", serde_json::to_string_pretty(&reaped)?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    reaper
        .run_with_shutdown(async move { shutdown.cancelled().await })
        .await
}
