//! Scheduler layer for the worker
//!
//! This layer claims builds from the orchestrator queue and coordinates
//! their execution. It owns each build's lease from claim to report.

pub mod poller;

pub use poller::BuildPoller;
