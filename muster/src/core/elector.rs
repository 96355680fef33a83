//! Leader election for tasks that should run on a single instance, such as the
//! lease reaper.
//!
//! ```rust
//! use muster::core::elector::{AlwaysLeader, Elector, NeverLeader};
//!
//! # async fn example() {
//! assert!(AlwaysLeader.is_leader().await.unwrap());
//! assert!(!NeverLeader.is_leader().await.unwrap());
//! # }
//! ```

use async_trait::async_trait;
use thiserror::Error;

/// Decides whether this instance currently leads.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Called on every tick of the gated task; should be cheap and idempotent.
    async fn is_leader(&self) -> Result<bool, ElectorError>;

    /// Give up leadership, e.g. on graceful shutdown. Default: no-op.
    async fn release_leadership(&self) -> Result<(), ElectorError> {
        Ok(())
    }
}

/// Errors that can occur during leader election
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ElectorError {
    #[error("Failed to acquire or check leader status: {0}")]
    AcquisitionError(String),

    #[error("Database error during leader election: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

/// Always leads. For single-instance deployments, SQLite in particular.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

#[async_trait]
impl Elector for AlwaysLeader {
    async fn is_leader(&self) -> Result<bool, ElectorError> {
        Ok(true)
    }
}

/// Never leads. For nodes that should only run workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLeader;

#[async_trait]
impl Elector for NeverLeader {
    async fn is_leader(&self) -> Result<bool, ElectorError> {
        Ok(false)
    }
}
