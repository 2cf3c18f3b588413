//! Core domain types
//!
//! This module contains the core domain structures used across Cygni services.
//! These types are shared between the orchestrator (which persists and mutates
//! them) and the worker (which executes builds and reports back).

pub mod build;
pub mod canary;
pub mod deployment;
pub mod event;
pub mod log;
pub mod routing;
