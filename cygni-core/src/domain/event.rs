//! Lifecycle events surfaced to external alerting and webhook systems

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BuildCreated,
    BuildSucceeded,
    BuildFailed,
    BuildCancelled,
    DeploymentActivated,
    DeploymentFailed,
    CanaryStarted,
    CanaryTrafficShifted,
    CanaryPromoted,
    CanaryRolledBack,
    CanaryPaused,
    /// Degraded-but-non-terminal conditions, such as a failed termination call
    OperationalWarning,
}

/// A state change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Build, deployment or canary id the event is about
    pub subject_id: Uuid,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary for downstream alerting
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl LifecycleEvent {
    pub fn new(
        kind: EventKind,
        subject_id: Uuid,
        project_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_id,
            project_id: project_id.into(),
            timestamp: Utc::now(),
            summary: summary.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
