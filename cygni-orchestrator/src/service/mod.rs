//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between stores and adapters and own every state
//! transition; the API layer only calls into them.

pub mod build;
pub mod deployment;
pub mod error;
pub mod log;

pub use build::{BuildService, QueueSettings};
pub use deployment::DeploymentService;
pub use error::{ServiceError, ServiceResult};
pub use log::LogService;
