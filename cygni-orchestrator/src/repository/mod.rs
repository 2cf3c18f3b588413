//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each store trait covers one domain entity. `Pg*` implementations persist to
//! Postgres; [`MemoryStore`] implements every trait in-process for local runs
//! and tests. Conditional updates return `None` when the guarded precondition
//! (status, lease token) no longer holds, so callers can tell a lost race from
//! a missing record.

pub mod build;
pub mod canary;
pub mod deployment;
pub mod log;
pub mod memory;

use thiserror::Error;

pub use build::{BuildStore, Finish, PgBuildStore};
pub use canary::{CanaryStore, PgCanaryStore};
pub use deployment::{DeploymentStore, PgDeploymentStore};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness constraint rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    /// A persisted value could not be decoded into its domain type
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
