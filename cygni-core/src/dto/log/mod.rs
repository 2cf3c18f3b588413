//! Log DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::log::LogEntry;

/// Log batch sent from a worker to the orchestrator
///
/// Carries the lease token so only the current lease holder can append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub worker_id: String,
    pub lease_token: Uuid,
    pub entries: Vec<LogEntry>,
}
