//! Cygni Core
//!
//! Core types and abstractions for the Cygni build-and-release system.
//!
//! This crate contains:
//! - Domain types: Builds, Deployments, Canary releases, routing weights, lifecycle events
//! - DTOs: Data transfer objects for inter-service communication

pub mod domain;
pub mod dto;
