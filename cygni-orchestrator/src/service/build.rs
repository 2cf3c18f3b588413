//! Build Service
//!
//! Owns the build lifecycle: submission, lease-based claiming, heartbeats,
//! completion with retry, cancellation and deletion. Every status change is a
//! conditional store update, so a terminal build is never written again.

use chrono::{DateTime, Utc};
use cygni_core::domain::build::{
    Build, BuildJob, BuildOutcome, BuildStatus, DEFAULT_MANIFEST_PATH, FailureKind,
};
use cygni_core::domain::deployment::DeploymentStatus;
use cygni_core::domain::event::{EventKind, LifecycleEvent};
use cygni_core::domain::log::{LogEntry, LogLevel, render_text};
use cygni_core::dto::build::{
    BuildView, CancelAck, ClaimedBuild, CompleteBuild, Heartbeat, HeartbeatAck, SubmitBuild,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::deployment::DeploymentService;
use super::error::{ServiceError, ServiceResult, codes};
use super::log::LogService;
use crate::adapter::Notifications;
use crate::repository::{BuildStore, DeploymentStore, Finish};

/// Environment used when a submission names none
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Queue leasing and retry parameters
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub lease: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl QueueSettings {
    /// Delay before the next attempt: `retry_backoff * 2^(attempt - 1)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

pub struct BuildService {
    builds: Arc<dyn BuildStore>,
    deployments: Arc<dyn DeploymentStore>,
    deployer: Arc<DeploymentService>,
    logs: Arc<LogService>,
    notifications: Notifications,
    settings: QueueSettings,
}

impl BuildService {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        deployments: Arc<dyn DeploymentStore>,
        deployer: Arc<DeploymentService>,
        logs: Arc<LogService>,
        notifications: Notifications,
        settings: QueueSettings,
    ) -> Self {
        Self {
            builds,
            deployments,
            deployer,
            logs,
            notifications,
            settings,
        }
    }

    /// Enqueues a build. Rejects missing project, repository or commit
    /// without creating anything.
    pub async fn submit(&self, req: SubmitBuild) -> ServiceResult<Build> {
        let project_id = required("project_id", req.project_id)?;
        let repository = required("repository", req.repository)?;
        let commit_sha = required("commit_sha", req.commit_sha)?;

        if let Some(policy) = &req.canary {
            policy
                .validate()
                .map_err(|e| ServiceError::Validation(format!("canary policy: {}", e)))?;
        }

        let job = BuildJob {
            project_id,
            context_location: req
                .context_location
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| repository.clone()),
            repository,
            commit_sha,
            branch: req.branch.filter(|b| !b.trim().is_empty()),
            manifest_path: req
                .manifest_path
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MANIFEST_PATH.to_string()),
            build_args: req.build_args,
        };
        let environment_id = req
            .environment_id
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let build = Build::new(job, environment_id, req.canary);
        self.builds.insert(&build).await?;

        tracing::info!(
            "Build created: {} for {}@{}",
            build.id,
            build.job.project_id,
            build.job.commit_sha
        );
        self.notifications.emit(LifecycleEvent::new(
            EventKind::BuildCreated,
            build.id,
            &build.job.project_id,
            format!("Build queued for commit {}", build.job.commit_sha),
        ));

        Ok(build)
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Build> {
        self.builds
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("build {}", id)))
    }

    /// Status plus accumulated log text
    pub async fn view(&self, id: Uuid) -> ServiceResult<BuildView> {
        let build = self.get(id).await?;
        let logs = render_text(&self.logs.entries(id).await?);
        Ok(BuildView { build, logs })
    }

    pub async fn list_by_project(&self, project_id: &str) -> ServiceResult<Vec<Build>> {
        Ok(self.builds.list_by_project(project_id).await?)
    }

    // =========================================================================
    // Worker protocol
    // =========================================================================

    /// Leases the next available build to a worker.
    ///
    /// A build reclaimed after too many expired leases is failed instead of
    /// handed out again.
    pub async fn claim(&self, worker_id: &str) -> ServiceResult<Option<ClaimedBuild>> {
        if worker_id.trim().is_empty() {
            return Err(ServiceError::Validation("worker_id is required".to_string()));
        }

        self.expire_cancel_requests().await?;

        loop {
            let now = Utc::now();
            let Some(build) = self
                .builds
                .claim_next(worker_id, now, lease_until(now, self.settings.lease))
                .await?
            else {
                return Ok(None);
            };

            let (Some(lease_token), Some(lease_expires_at)) =
                (build.lease_token, build.lease_expires_at)
            else {
                return Err(ServiceError::InvalidState(format!(
                    "claimed build {} carries no lease",
                    build.id
                )));
            };

            if build.attempts > self.settings.max_attempts {
                let reason = format!(
                    "abandoned after {} attempts without a result",
                    self.settings.max_attempts
                );
                tracing::warn!("Build {} {}", build.id, reason);
                if let Some(failed) = self
                    .builds
                    .finish(build.id, Some(lease_token), Finish::failed(reason))
                    .await?
                {
                    self.finished(&failed);
                }
                continue;
            }

            if build.attempts > 1 {
                tracing::info!(
                    "Build {} reclaimed by {} (attempt {})",
                    build.id,
                    worker_id,
                    build.attempts
                );
            } else {
                tracing::info!("Build {} claimed by {}", build.id, worker_id);
            }

            return Ok(Some(ClaimedBuild {
                build_id: build.id,
                lease_token,
                lease_expires_at,
                attempt: build.attempts,
                job: build.job,
            }));
        }
    }

    /// Renews a lease. A build cancelled under the caller's lease answers
    /// with `cancel_requested` so the worker stops and acknowledges.
    pub async fn heartbeat(&self, id: Uuid, req: Heartbeat) -> ServiceResult<HeartbeatAck> {
        let current = self.get(id).await?;
        if !current.is_leased_by(&req.worker_id, req.lease_token) {
            return Err(ServiceError::LeaseLost(id));
        }

        if current.status == BuildStatus::Cancelled && current.cancel_requested {
            return Ok(HeartbeatAck {
                lease_expires_at: None,
                cancel_requested: true,
            });
        }

        let renewed = self
            .builds
            .renew_lease(id, req.lease_token, lease_until(Utc::now(), self.settings.lease))
            .await?
            .ok_or(ServiceError::LeaseLost(id))?;

        Ok(HeartbeatAck {
            lease_expires_at: renewed.lease_expires_at,
            cancel_requested: renewed.cancel_requested,
        })
    }

    /// Records the result of an attempt reported by the lease holder.
    ///
    /// A worker that finished before it saw a cancellation gets the
    /// cancelled build back; its report counts as the acknowledgement.
    pub async fn complete(&self, id: Uuid, req: CompleteBuild) -> ServiceResult<Build> {
        let current = self.get(id).await?;
        if current.status == BuildStatus::Cancelled
            && current.cancel_requested
            && current.is_leased_by(&req.worker_id, req.lease_token)
        {
            tracing::info!(
                "Build {} finished after cancellation; treating report as acknowledgement",
                id
            );
            return self
                .ack_cancel(
                    id,
                    CancelAck {
                        worker_id: req.worker_id,
                        lease_token: req.lease_token,
                        termination_error: None,
                    },
                )
                .await;
        }
        if current.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "build {} is already {}",
                id, current.status
            )));
        }
        if !current.is_leased_by(&req.worker_id, req.lease_token) {
            return Err(ServiceError::LeaseLost(id));
        }

        match req.outcome {
            BuildOutcome::Succeeded { image_ref } => {
                if image_ref.trim().is_empty() {
                    return Err(ServiceError::Validation(
                        "image_ref is required for a successful build".to_string(),
                    ));
                }
                let build = self
                    .builds
                    .finish(id, Some(req.lease_token), Finish::success(image_ref))
                    .await?
                    .ok_or(ServiceError::LeaseLost(id))?;

                self.finished(&build);

                // The build result is committed; deployment problems are
                // recorded on the deployment itself
                if let Err(e) = self.deployer.deploy_build(&build).await {
                    tracing::error!("Failed to deploy build {}: {}", build.id, e);
                    self.notifications.emit(LifecycleEvent::new(
                        EventKind::OperationalWarning,
                        build.id,
                        &build.job.project_id,
                        format!("Deployment of build {} failed: {}", build.id, e),
                    ));
                }

                Ok(build)
            }
            BuildOutcome::Failed {
                kind: FailureKind::Infrastructure,
                reason,
            } if current.attempts < self.settings.max_attempts => {
                let delay = self.settings.backoff_for(current.attempts);
                let available_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

                let build = self
                    .builds
                    .requeue(id, req.lease_token, available_at, &reason)
                    .await?
                    .ok_or(ServiceError::LeaseLost(id))?;

                tracing::warn!(
                    "Build {} attempt {} failed ({}); retrying in {:?}",
                    id,
                    current.attempts,
                    reason,
                    delay
                );
                self.logs
                    .record(
                        id,
                        LogEntry::new(
                            LogLevel::Warning,
                            format!(
                                "attempt {} failed: {}; retrying in {}s",
                                current.attempts,
                                reason,
                                delay.as_secs()
                            ),
                        ),
                    )
                    .await?;

                Ok(build)
            }
            BuildOutcome::Failed { kind, reason } => {
                let reason = if kind == FailureKind::Infrastructure {
                    format!("{} (gave up after {} attempts)", reason, current.attempts)
                } else {
                    reason
                };
                let build = self
                    .builds
                    .finish(id, Some(req.lease_token), Finish::failed(reason))
                    .await?
                    .ok_or(ServiceError::LeaseLost(id))?;

                self.finished(&build);
                Ok(build)
            }
        }
    }

    // =========================================================================
    // Cancellation and deletion
    // =========================================================================

    /// Cancels a pending or running build. Idempotent: a terminal build is
    /// returned unchanged.
    pub async fn cancel(&self, id: Uuid) -> ServiceResult<Build> {
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        match self.builds.cancel(id, Utc::now()).await? {
            Some(build) => {
                tracing::info!("Build {} cancelled (was {})", id, current.status);
                self.finished(&build);
                Ok(build)
            }
            // Finished concurrently; report whatever won
            None => self.get(id).await,
        }
    }

    /// Worker confirmation that a cancelled build's execution was stopped
    pub async fn ack_cancel(&self, id: Uuid, req: CancelAck) -> ServiceResult<Build> {
        let current = self.get(id).await?;
        if current.status != BuildStatus::Cancelled {
            return Err(ServiceError::InvalidState(format!(
                "build {} is {}, not cancelled",
                id, current.status
            )));
        }
        if !current.is_leased_by(&req.worker_id, req.lease_token) {
            return Err(ServiceError::LeaseLost(id));
        }

        let build = self
            .builds
            .clear_cancel_request(id, req.lease_token)
            .await?
            .unwrap_or(current);
        self.logs.close(id);

        match req.termination_error {
            Some(error) => {
                tracing::warn!("Build {} cancelled but termination failed: {}", id, error);
                self.notifications.emit(
                    LifecycleEvent::new(
                        EventKind::OperationalWarning,
                        id,
                        &build.job.project_id,
                        format!("Failed to terminate cancelled build {}: {}", id, error),
                    )
                    .with_details(serde_json::json!({
                        "worker_id": req.worker_id,
                        "termination_error": error,
                    })),
                );
            }
            None => tracing::info!("Build {} termination acknowledged by {}", id, req.worker_id),
        }

        Ok(build)
    }

    /// Gives up on acknowledgements older than one lease; the worker that
    /// held the build is gone
    async fn expire_cancel_requests(&self) -> ServiceResult<()> {
        let lease = chrono::Duration::from_std(self.settings.lease)
            .unwrap_or(chrono::Duration::seconds(120));
        let cutoff = Utc::now() - lease;
        for id in self.builds.expire_cancel_requests(cutoff).await? {
            tracing::warn!("Build {} was cancelled but its worker never acknowledged", id);
            self.logs.close(id);
        }
        Ok(())
    }

    /// Deletes a terminal build whose deployments are all failed or rolled
    /// back, together with those deployments
    pub async fn delete(&self, id: Uuid) -> ServiceResult<()> {
        let build = self.get(id).await?;
        if !build.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "build {} is {}; cancel it first",
                id, build.status
            )));
        }

        let deployments = self.deployments.list_by_build(id).await?;
        if let Some(live) = deployments.iter().find(|d| {
            !matches!(
                d.status,
                DeploymentStatus::Failed | DeploymentStatus::RolledBack
            )
        }) {
            return Err(ServiceError::invariant(
                codes::BUILD_HAS_ACTIVE_DEPLOYMENTS,
                format!("deployment {} of build {} is {}", live.id, id, live.status),
            ));
        }

        self.deployments.delete_by_build(id).await?;
        if !self.builds.delete(id).await? {
            return Err(ServiceError::NotFound(format!("build {}", id)));
        }
        self.logs.close(id);

        tracing::info!(
            "Build {} deleted with {} deployment(s)",
            id,
            deployments.len()
        );
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Emits the terminal event and ends live logs unless a worker still
    /// has to acknowledge a cancellation
    fn finished(&self, build: &Build) {
        let (kind, summary) = match build.status {
            BuildStatus::Success => (
                EventKind::BuildSucceeded,
                format!(
                    "Build of {} produced {}",
                    build.job.commit_sha,
                    build.image_ref.as_deref().unwrap_or_default()
                ),
            ),
            BuildStatus::Failed => (
                EventKind::BuildFailed,
                format!(
                    "Build of {} failed: {}",
                    build.job.commit_sha,
                    build.failure_reason.as_deref().unwrap_or("unknown reason")
                ),
            ),
            BuildStatus::Cancelled => (
                EventKind::BuildCancelled,
                format!("Build of {} cancelled", build.job.commit_sha),
            ),
            BuildStatus::Pending | BuildStatus::Running => return,
        };

        if !build.cancel_requested {
            self.logs.close(build.id);
        }
        self.notifications.emit(
            LifecycleEvent::new(kind, build.id, &build.job.project_id, summary).with_details(
                serde_json::json!({
                    "status": build.status,
                    "attempts": build.attempts,
                    "image_ref": build.image_ref,
                    "failure_reason": build.failure_reason,
                }),
            ),
        );
    }
}

fn required(field: &str, value: String) -> ServiceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(120))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::Harness;
    use cygni_core::dto::log::LogBatch;

    async fn claim(h: &Harness) -> ClaimedBuild {
        h.state.builds.claim("worker-1").await.unwrap().unwrap()
    }

    fn failure(claimed: &ClaimedBuild, kind: FailureKind, reason: &str) -> CompleteBuild {
        CompleteBuild {
            worker_id: "worker-1".to_string(),
            lease_token: claimed.lease_token,
            outcome: BuildOutcome::Failed {
                kind,
                reason: reason.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_fields() {
        let h = Harness::new();

        let mut req = Harness::submission("web", "abc123");
        req.commit_sha = "  ".to_string();
        let err = h.state.builds.submit(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("commit_sha")));

        let mut req = Harness::submission("web", "abc123");
        req.project_id.clear();
        assert!(matches!(
            h.state.builds.submit(req).await,
            Err(ServiceError::Validation(_))
        ));

        assert!(h.state.builds.list_by_project("web").await.unwrap().is_empty());
        assert!(h.state.builds.claim("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_applies_defaults() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();

        assert_eq!(build.status, BuildStatus::Pending);
        assert_eq!(build.environment_id, DEFAULT_ENVIRONMENT);
        assert_eq!(build.job.manifest_path, DEFAULT_MANIFEST_PATH);
        assert_eq!(build.job.context_location, build.job.repository);
        h.notifier.wait_for(EventKind::BuildCreated).await;
    }

    #[tokio::test]
    async fn test_successful_build_is_deployed_with_all_traffic() {
        let h = Harness::new();
        let (build, deployment) = h.ship("web", "abc123", None).await;

        assert_eq!(build.status, BuildStatus::Success);
        assert_eq!(build.image_ref.as_deref(), Some("registry.local/web:abc123"));
        assert!(build.completed_at.is_some());

        assert_eq!(deployment.status, DeploymentStatus::Active);
        assert_eq!(deployment.image_ref, "registry.local/web:abc123");
        assert_eq!(h.weight_of("web", deployment.id).await, 100.0);

        h.notifier.wait_for(EventKind::BuildSucceeded).await;
        h.notifier.wait_for(EventKind::DeploymentActivated).await;
    }

    #[tokio::test]
    async fn test_router_failure_fails_deployment_not_build() {
        let h = Harness::new();
        h.router.fail(true);

        let (build, deployment) = h.ship("web", "abc123", None).await;
        assert_eq!(build.status, BuildStatus::Success);
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.reason.unwrap().contains("router unavailable"));
        h.notifier.wait_for(EventKind::DeploymentFailed).await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal_builds() {
        let h = Harness::new();
        let (build, _) = h.ship("web", "abc123", None).await;

        let again = h.state.builds.cancel(build.id).await.unwrap();
        assert_eq!(again.status, BuildStatus::Success);
        assert_eq!(again.image_ref, build.image_ref);
    }

    #[tokio::test]
    async fn test_cancel_pending_build_never_runs() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();

        let cancelled = h.state.builds.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(!cancelled.cancel_requested);
        assert!(h.state.builds.claim("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_build_is_acknowledged_by_worker() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;

        let cancelled = h.state.builds.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(cancelled.cancel_requested);

        let heartbeat = Heartbeat {
            worker_id: "worker-1".to_string(),
            lease_token: claimed.lease_token,
        };
        let ack = h.state.builds.heartbeat(build.id, heartbeat).await.unwrap();
        assert!(ack.cancel_requested);
        assert!(ack.lease_expires_at.is_none());

        // Output produced while stopping is still accepted
        h.state
            .logs
            .append(
                build.id,
                LogBatch {
                    worker_id: "worker-1".to_string(),
                    lease_token: claimed.lease_token,
                    entries: vec![LogEntry::new(LogLevel::Info, "stopping container")],
                },
            )
            .await
            .unwrap();

        let done = h
            .state
            .builds
            .ack_cancel(
                build.id,
                CancelAck {
                    worker_id: "worker-1".to_string(),
                    lease_token: claimed.lease_token,
                    termination_error: Some("podman kill: no such container".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, BuildStatus::Cancelled);
        assert!(!done.cancel_requested);

        let warning = h.notifier.wait_for(EventKind::OperationalWarning).await;
        assert!(warning.summary.contains("no such container"));

        // A late completion cannot resurrect the build
        let late = h
            .state
            .builds
            .complete(build.id, failure(&claimed, FailureKind::BuildLogic, "killed"))
            .await;
        assert!(matches!(late, Err(ServiceError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_completion_after_cancel_acknowledges_it() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;
        h.state.builds.cancel(build.id).await.unwrap();
        let follow = h.state.logs.follow(build.id).await.unwrap();

        let done = h
            .state
            .builds
            .complete(
                build.id,
                CompleteBuild {
                    worker_id: "worker-1".to_string(),
                    lease_token: claimed.lease_token,
                    outcome: BuildOutcome::Succeeded {
                        image_ref: "registry.local/web:abc123".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, BuildStatus::Cancelled);
        assert!(!done.cancel_requested);
        assert!(done.image_ref.is_none());
        assert!(follow.updates.unwrap().recv().await.is_err());
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_expires_after_lease() {
        let h = Harness::with_config(Config {
            build_lease: Duration::from_millis(50),
            ..crate::testing::test_config()
        });
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        claim(&h).await;
        h.state.builds.cancel(build.id).await.unwrap();
        let follow = h.state.logs.follow(build.id).await.unwrap();

        // The worker died without acknowledging
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.state.builds.claim("worker-2").await.unwrap().is_none());

        let build = h.state.builds.get(build.id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Cancelled);
        assert!(!build.cancel_requested);
        assert!(follow.updates.unwrap().recv().await.is_err());
    }

    #[tokio::test]
    async fn test_infrastructure_failures_retry_until_exhausted() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();

        for attempt in 1..=2 {
            let claimed = claim(&h).await;
            assert_eq!(claimed.attempt, attempt);
            let requeued = h
                .state
                .builds
                .complete(
                    build.id,
                    failure(&claimed, FailureKind::Infrastructure, "registry unreachable"),
                )
                .await
                .unwrap();
            assert_eq!(requeued.status, BuildStatus::Pending);
        }

        let claimed = claim(&h).await;
        assert_eq!(claimed.attempt, 3);
        let failed = h
            .state
            .builds
            .complete(
                build.id,
                failure(&claimed, FailureKind::Infrastructure, "registry unreachable"),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(
            failed.failure_reason.as_deref(),
            Some("registry unreachable (gave up after 3 attempts)")
        );

        let view = h.state.builds.view(build.id).await.unwrap();
        assert!(view.logs.contains("attempt 1 failed: registry unreachable"));
        assert!(view.logs.contains("attempt 2 failed"));
    }

    #[tokio::test]
    async fn test_build_logic_failure_is_not_retried() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;

        let failed = h
            .state
            .builds
            .complete(
                build.id,
                failure(&claimed, FailureKind::BuildLogic, "RUN npm test exited with 1"),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("RUN npm test exited with 1"));
        assert_eq!(failed.attempts, 1);
        assert!(h.state.builds.claim("worker-1").await.unwrap().is_none());
        assert!(h.state.deployments.list_by_project("web").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_token_is_rejected() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;

        let stale = CompleteBuild {
            worker_id: "worker-1".to_string(),
            lease_token: Uuid::new_v4(),
            outcome: BuildOutcome::Succeeded {
                image_ref: "registry.local/web:abc123".to_string(),
            },
        };
        assert!(matches!(
            h.state.builds.complete(build.id, stale).await,
            Err(ServiceError::LeaseLost(_))
        ));

        let other_worker = Heartbeat {
            worker_id: "worker-2".to_string(),
            lease_token: claimed.lease_token,
        };
        assert!(matches!(
            h.state.builds.heartbeat(build.id, other_worker).await,
            Err(ServiceError::LeaseLost(_))
        ));

        assert_eq!(
            h.state.builds.get(build.id).await.unwrap().status,
            BuildStatus::Running
        );
    }

    #[tokio::test]
    async fn test_successful_build_requires_image_ref() {
        let h = Harness::new();
        let build = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;

        let req = CompleteBuild {
            worker_id: "worker-1".to_string(),
            lease_token: claimed.lease_token,
            outcome: BuildOutcome::Succeeded {
                image_ref: String::new(),
            },
        };
        assert!(matches!(
            h.state.builds.complete(build.id, req).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let h = Harness::new();

        let running = h
            .state
            .builds
            .submit(Harness::submission("web", "abc123"))
            .await
            .unwrap();
        let claimed = claim(&h).await;
        assert!(matches!(
            h.state.builds.delete(running.id).await,
            Err(ServiceError::InvalidState(_))
        ));

        h.state
            .builds
            .complete(running.id, failure(&claimed, FailureKind::BuildLogic, "broken"))
            .await
            .unwrap();
        h.state.builds.delete(running.id).await.unwrap();
        assert!(matches!(
            h.state.builds.get(running.id).await,
            Err(ServiceError::NotFound(_))
        ));

        let (shipped, _) = h.ship("web", "def456", None).await;
        match h.state.builds.delete(shipped.id).await {
            Err(ServiceError::Invariant { code, .. }) => {
                assert_eq!(code, codes::BUILD_HAS_ACTIVE_DEPLOYMENTS)
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let settings = QueueSettings {
            lease: Duration::from_secs(120),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(10),
        };
        assert_eq!(settings.backoff_for(1), Duration::from_secs(10));
        assert_eq!(settings.backoff_for(2), Duration::from_secs(20));
        assert_eq!(settings.backoff_for(4), Duration::from_secs(80));
    }
}
