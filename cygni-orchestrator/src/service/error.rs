//! Service errors
//!
//! One taxonomy for every orchestration operation. The API layer maps each
//! variant onto an HTTP status.

use thiserror::Error;
use uuid::Uuid;

use crate::adapter::AdapterError;
use crate::repository::StoreError;

/// Invariant violation codes
pub mod codes {
    pub const CANARY_ALREADY_ACTIVE: &str = "CANARY_ALREADY_ACTIVE";
    pub const TRAFFIC_WEIGHTS_INVALID: &str = "TRAFFIC_WEIGHTS_INVALID";
    pub const BUILD_HAS_ACTIVE_DEPLOYMENTS: &str = "BUILD_HAS_ACTIVE_DEPLOYMENTS";
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    /// Bad or missing input; nothing was created or changed
    #[error("{0}")]
    Validation(String),

    /// The record's current state does not allow the operation
    #[error("{0}")]
    InvalidState(String),

    #[error("{message}")]
    Invariant { code: &'static str, message: String },

    /// The caller's lease token no longer holds the build
    #[error("lease on build {0} is not held by this worker")]
    LeaseLost(Uuid),

    /// An external system failed; state was left unchanged
    #[error("{0}")]
    Infrastructure(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn invariant(code: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Invariant {
            code,
            message: message.into(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
