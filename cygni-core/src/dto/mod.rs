//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between Cygni services
//! (orchestrator, worker, external CRUD layer). DTOs are lightweight
//! representations of domain entities optimized for network transfer.

pub mod build;
pub mod canary;
pub mod log;
