//! Deployment domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::build::Build;

/// One running instance of a built image for a project/environment
///
/// Created only from a successful build. Owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: String,
    pub environment_id: String,
    pub build_id: Uuid,
    pub image_ref: String,
    pub status: DeploymentStatus,
    /// Reason recorded on failure or rollback
    pub reason: Option<String>,
    /// Operational annotations
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Creates a pending deployment for a successful build
    ///
    /// Returns `None` if the build has not succeeded or carries no image.
    pub fn from_build(build: &Build) -> Option<Self> {
        if build.status != crate::domain::build::BuildStatus::Success {
            return None;
        }
        let image_ref = build.image_ref.clone()?;
        let now = Utc::now();

        let mut metadata = HashMap::new();
        metadata.insert(
            "commit_sha".to_string(),
            serde_json::Value::String(build.job.commit_sha.clone()),
        );
        if let Some(branch) = &build.job.branch {
            metadata.insert(
                "branch".to_string(),
                serde_json::Value::String(branch.clone()),
            );
        }

        Some(Self {
            id: Uuid::new_v4(),
            project_id: build.job.project_id.clone(),
            environment_id: build.environment_id.clone(),
            build_id: build.id,
            image_ref,
            status: DeploymentStatus::Pending,
            reason: None,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// Routing variant identifier for this deployment
    pub fn variant_id(&self) -> String {
        self.id.to_string()
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::RolledBack)
    }

    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Deploying, Active)
                | (Deploying, Failed)
                | (Deploying, RolledBack)
                | (Active, RolledBack)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "active" => Ok(DeploymentStatus::Active),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(format!("unknown deployment status '{}'", other)),
        }
    }
}
