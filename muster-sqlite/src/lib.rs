//! SQLite implementation of the Queue and LogSink traits from muster.
//!
//! Meant for single-node deployments and tests. There is no leader election
//! here; run one reaper per database with [`muster::core::elector::AlwaysLeader`].

pub mod log_sink;
pub mod queue;
mod types;

use anyhow::Context;
pub use log_sink::SqliteLogSink;
pub use queue::SqliteQueue;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Open a pool for `url` and bring the schema up to date.
///
/// Every connection gets `case_sensitive_like` so that type prefixes match the
/// same way they do on PostgreSQL. An in-memory database lives as long as its
/// connection, so `sqlite::memory:` pools keep exactly one connection forever.
pub async fn make_pool(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid SQLite url '{url}'"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .pragma("case_sensitive_like", "ON");

    let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .context("Failed to open SQLite database")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run SQLite migrations")?;
    Ok(pool)
}
