//! Execution service
//!
//! Runs a claimed build to a result. The scheduler owns the lease and the
//! reporting; this service only turns a build job into an image.

use async_trait::async_trait;
use cygni_core::dto::build::ClaimedBuild;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::context::BuildContext;
use crate::execution::ExecutionResult;
use crate::podman::ImageBuilder;

/// Service trait for executing builds
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Executes one attempt of a build. Never fails: every way a build can
    /// end is an `ExecutionResult`.
    async fn execute(&self, build: &ClaimedBuild, ctx: Arc<BuildContext>) -> ExecutionResult;
}

/// Builds images with podman
pub struct PodmanExecutionService {
    builder: ImageBuilder,
}

impl PodmanExecutionService {
    pub fn new(config: &Config) -> Self {
        Self {
            builder: ImageBuilder::new(
                config.image_registry.clone(),
                config.workspace_base.clone(),
                config.build_timeout,
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.builder.timeout()
    }
}

#[async_trait]
impl ExecutionService for PodmanExecutionService {
    async fn execute(&self, build: &ClaimedBuild, ctx: Arc<BuildContext>) -> ExecutionResult {
        info!(
            "Executing build {} (attempt {}) for {}@{}",
            build.build_id, build.attempt, build.job.project_id, build.job.commit_sha
        );
        ctx.log_info(format!(
            "Attempt {} of build for {} at {}",
            build.attempt, build.job.project_id, build.job.commit_sha
        ));

        let result = self.builder.run(&ctx, &build.job).await;

        match &result {
            ExecutionResult::Succeeded { image_ref } => {
                ctx.log_info(format!("Build succeeded: {}", image_ref));
            }
            ExecutionResult::Failed { kind, reason } => {
                ctx.log_error(format!("Build failed ({:?}): {}", kind, reason));
            }
            ExecutionResult::Cancelled { .. } => ctx.log_warning("Build cancelled"),
            ExecutionResult::TimedOut { after_secs } => {
                ctx.log_error(format!("Build timed out after {}s", after_secs));
            }
        }

        result
    }
}
