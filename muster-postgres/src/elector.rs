//! Leader election on a PostgreSQL session-level advisory lock.

use anyhow::Context;
use async_trait::async_trait;
use muster::core::elector::{Elector, ElectorError};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Advisory lock key used by [`PgAdvisoryLockElector::new`].
pub const DEFAULT_LOCK_KEY: i64 = 0x6d75_7374_6572;

/// Leads while it holds `pg_try_advisory_lock(key)`.
///
/// The lock belongs to a database session, so the elector keeps one pooled
/// connection checked out for as long as it leads. If that connection dies, the
/// server drops the lock and another instance can take over.
pub struct PgAdvisoryLockElector {
    pool: PgPool,
    key: i64,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgAdvisoryLockElector {
    pub fn new(pool: PgPool) -> Self {
        Self::with_key(pool, DEFAULT_LOCK_KEY)
    }

    pub fn with_key(pool: PgPool, key: i64) -> Self {
        Self {
            pool,
            key,
            conn: Mutex::new(None),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

#[async_trait]
impl Elector for PgAdvisoryLockElector {
    async fn is_leader(&self) -> Result<bool, ElectorError> {
        let mut held = self.conn.lock().await;

        if let Some(conn) = held.as_mut() {
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => return Ok(true),
                Err(e) => {
                    warn!(error = %e, key = self.key, "Lost leader connection");
                    if let Some(conn) = held.take() {
                        drop(conn.detach());
                    }
                }
            }
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for leader election")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to try advisory lock")?;

        if acquired {
            info!(key = self.key, "Became leader");
            *held = Some(conn);
        } else {
            debug!(key = self.key, "Advisory lock held elsewhere");
        }
        Ok(acquired)
    }

    async fn release_leadership(&self) -> Result<(), ElectorError> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(_) => {
                info!(key = self.key, "Released leadership");
                Ok(())
            }
            Err(e) => {
                // Closing the session drops the lock with it.
                drop(conn.detach());
                Err(ElectorError::DatabaseError(
                    anyhow::Error::new(e).context("Failed to release advisory lock"),
                ))
            }
        }
    }
}
