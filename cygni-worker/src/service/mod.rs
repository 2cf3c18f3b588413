//! Service layer
//!
//! Services contain the worker's business logic: executing builds and
//! buffering their output. Both are trait-based so the scheduler can be
//! driven with other executors.

mod execution;
mod log_buffer;

pub use execution::{ExecutionService, PodmanExecutionService};
pub use log_buffer::{InMemoryLogBuffer, LogBufferService};
