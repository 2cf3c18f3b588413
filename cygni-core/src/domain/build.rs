//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::canary::CanaryPolicy;

/// Default manifest path inside the build context
pub const DEFAULT_MANIFEST_PATH: &str = "Containerfile";

/// A requested build
///
/// Immutable once enqueued. Referenced by exactly one [`Build`] record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub project_id: String,
    pub repository: String,
    pub commit_sha: String,
    pub branch: Option<String>,
    /// Location of the build context (local path or git URL)
    pub context_location: String,
    /// Path to the container manifest, relative to the context
    pub manifest_path: String,
    pub build_args: HashMap<String, String>,
}

/// Build execution record
///
/// Structure shared between orchestrator (persists) and worker (executes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub job: BuildJob,
    pub environment_id: String,
    /// Canary policy to apply once the build produces a deployment
    pub canary: Option<CanaryPolicy>,
    pub status: BuildStatus,
    pub image_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the queue may hand this build to a worker
    pub available_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Creates a new pending build for a job
    pub fn new(job: BuildJob, environment_id: String, canary: Option<CanaryPolicy>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job,
            environment_id,
            canary,
            status: BuildStatus::Pending,
            image_ref: None,
            failure_reason: None,
            attempts: 0,
            worker_id: None,
            lease_token: None,
            lease_expires_at: None,
            available_at: now,
            cancel_requested: false,
            requested_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the given worker currently holds the lease identified by `token`
    pub fn is_leased_by(&self, worker_id: &str, token: Uuid) -> bool {
        self.lease_token == Some(token) && self.worker_id.as_deref() == Some(worker_id)
    }
}

/// Build execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    /// Terminal builds accept no further mutation
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        match self {
            BuildStatus::Pending => matches!(
                next,
                BuildStatus::Running | BuildStatus::Failed | BuildStatus::Cancelled
            ),
            // Running -> Pending is a retry after an infrastructure failure
            BuildStatus::Running => next != BuildStatus::Running,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" => Ok(BuildStatus::Cancelled),
            other => Err(format!("unknown build status '{}'", other)),
        }
    }
}

/// Classification of a failed build attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor could not run the build (scheduling, registry, podman itself).
    /// Retried with backoff.
    Infrastructure,
    /// The build itself failed (bad manifest, compile error). Never retried.
    BuildLogic,
}

/// Terminal result a worker reports for one build attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded { image_ref: String },
    Failed { kind: FailureKind, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BuildStatus; 5] = [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failed,
        BuildStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_statuses_never_transition() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_running_transitions() {
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Success));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Cancelled));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Pending));
        assert!(!BuildStatus::Pending.can_transition_to(BuildStatus::Success));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<BuildStatus>(), Ok(status));
        }
        assert!("queued".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = BuildOutcome::Failed {
            kind: FailureKind::BuildLogic,
            reason: "exit code 1".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "build_logic");
    }

    #[test]
    fn test_is_leased_by() {
        let job = BuildJob {
            project_id: "proj".to_string(),
            repository: "git@example.com:proj.git".to_string(),
            commit_sha: "abc123".to_string(),
            branch: None,
            context_location: ".".to_string(),
            manifest_path: DEFAULT_MANIFEST_PATH.to_string(),
            build_args: HashMap::new(),
        };
        let mut build = Build::new(job, "production".to_string(), None);
        let token = Uuid::new_v4();
        build.worker_id = Some("worker-1".to_string());
        build.lease_token = Some(token);

        assert!(build.is_leased_by("worker-1", token));
        assert!(!build.is_leased_by("worker-2", token));
        assert!(!build.is_leased_by("worker-1", Uuid::new_v4()));
    }
}
