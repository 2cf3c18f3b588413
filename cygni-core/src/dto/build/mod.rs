//! Build DTOs for inter-service communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::build::{Build, BuildJob, BuildOutcome, BuildStatus};
use crate::domain::canary::CanaryPolicy;

/// Request to submit a new build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitBuild {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub commit_sha: String,
    pub branch: Option<String>,
    /// Build context location; defaults to the repository reference
    pub context_location: Option<String>,
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub build_args: HashMap<String, String>,
    pub environment_id: Option<String>,
    /// Roll the resulting deployment out as a canary with this policy
    pub canary: Option<CanaryPolicy>,
}

/// Build status and accumulated logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: Build,
    pub logs: String,
}

/// Request from a worker to claim the next available build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimBuild {
    pub worker_id: String,
}

/// Everything a worker needs to execute a claimed build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedBuild {
    pub build_id: Uuid,
    pub lease_token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
    pub attempt: u32,
    pub job: BuildJob,
}

/// Lease renewal from the worker holding a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub lease_token: Uuid,
}

/// Lease renewal response; `cancel_requested` is the cooperative cancel flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

/// Terminal report for one build attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteBuild {
    pub worker_id: String,
    pub lease_token: Uuid,
    #[serde(flatten)]
    pub outcome: BuildOutcome,
}

/// Worker acknowledgement that a cancelled build's execution was torn down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAck {
    pub worker_id: String,
    pub lease_token: Uuid,
    /// Set when terminating the external execution resource failed
    pub termination_error: Option<String>,
}

/// Lightweight build summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub id: Uuid,
    pub project_id: String,
    pub commit_sha: String,
    pub status: BuildStatus,
    pub image_ref: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Build> for BuildSummary {
    fn from(build: Build) -> Self {
        Self {
            id: build.id,
            project_id: build.job.project_id,
            commit_sha: build.job.commit_sha,
            status: build.status,
            image_ref: build.image_ref,
            requested_at: build.requested_at,
            completed_at: build.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build::FailureKind;

    #[test]
    fn test_complete_build_flattens_outcome() {
        let json = serde_json::json!({
            "worker_id": "worker-1",
            "lease_token": Uuid::nil(),
            "outcome": "failed",
            "kind": "infrastructure",
            "reason": "podman exited with 125"
        });
        let req: CompleteBuild = serde_json::from_value(json).unwrap();
        assert_eq!(
            req.outcome,
            BuildOutcome::Failed {
                kind: FailureKind::Infrastructure,
                reason: "podman exited with 125".to_string(),
            }
        );
    }

    #[test]
    fn test_submit_build_missing_fields_default_empty() {
        let req: SubmitBuild = serde_json::from_value(serde_json::json!({
            "repository": "https://example.com/app.git"
        }))
        .unwrap();
        assert!(req.project_id.is_empty());
        assert!(req.commit_sha.is_empty());
    }
}
