//! Deployment Service
//!
//! Turns each successful build into exactly one deployment. Without a canary
//! the deployment takes all traffic at once; with one, control passes to the
//! canary controller and the deployment stays `deploying` until the release
//! ends.

use cygni_core::domain::build::Build;
use cygni_core::domain::deployment::{Deployment, DeploymentStatus};
use cygni_core::domain::event::{EventKind, LifecycleEvent};
use cygni_core::domain::routing::VariantWeight;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use crate::adapter::{Notifications, TrafficRouter, with_deadline};
use crate::controller::CanaryController;
use crate::repository::DeploymentStore;

pub struct DeploymentService {
    deployments: Arc<dyn DeploymentStore>,
    router: Arc<dyn TrafficRouter>,
    controller: Arc<CanaryController>,
    notifications: Notifications,
    adapter_timeout: Duration,
}

impl DeploymentService {
    pub fn new(
        deployments: Arc<dyn DeploymentStore>,
        router: Arc<dyn TrafficRouter>,
        controller: Arc<CanaryController>,
        notifications: Notifications,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            deployments,
            router,
            controller,
            notifications,
            adapter_timeout,
        }
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Deployment> {
        self.deployments
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("deployment {}", id)))
    }

    pub async fn list_by_project(&self, project_id: &str) -> ServiceResult<Vec<Deployment>> {
        Ok(self.deployments.list_by_project(project_id).await?)
    }

    /// Creates and rolls out the deployment of a successful build
    pub async fn deploy_build(&self, build: &Build) -> ServiceResult<Deployment> {
        if self.deployments.list_by_build(build.id).await?.first().is_some() {
            return Err(ServiceError::InvalidState(format!(
                "build {} already has a deployment",
                build.id
            )));
        }

        let deployment = Deployment::from_build(build).ok_or_else(|| {
            ServiceError::InvalidState(format!(
                "build {} is {} and cannot be deployed",
                build.id, build.status
            ))
        })?;
        self.deployments.insert(&deployment).await?;

        let deployment = self
            .deployments
            .transition(
                deployment.id,
                &[DeploymentStatus::Pending],
                DeploymentStatus::Deploying,
                None,
            )
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidState(format!("deployment {} left pending", deployment.id))
            })?;

        tracing::info!(
            "Deployment {} created for build {} ({})",
            deployment.id,
            build.id,
            deployment.image_ref
        );

        if let Some(policy) = &build.canary {
            match self
                .deployments
                .latest_active(&deployment.project_id, &deployment.environment_id, deployment.id)
                .await?
            {
                Some(stable) => {
                    return match self
                        .controller
                        .launch(&deployment, &stable, policy.clone())
                        .await
                    {
                        Ok(release) => {
                            tracing::info!(
                                "Deployment {} handed to canary {}",
                                deployment.id,
                                release.id
                            );
                            Ok(deployment)
                        }
                        Err(e) => self.fail(deployment, format!("canary start failed: {}", e)).await,
                    };
                }
                None => {
                    tracing::warn!(
                        "Build {} requested a canary but {}/{} has no active deployment; deploying directly",
                        build.id,
                        deployment.project_id,
                        deployment.environment_id
                    );
                }
            }
        }

        self.activate(deployment).await
    }

    /// Routes all traffic to the deployment and marks it active
    async fn activate(&self, deployment: Deployment) -> ServiceResult<Deployment> {
        let weights = [VariantWeight::new(deployment.variant_id(), 100.0)];
        if let Err(e) = with_deadline(
            self.adapter_timeout,
            self.router.set_weights(&deployment.project_id, &weights),
        )
        .await
        {
            return self.fail(deployment, format!("traffic router: {}", e)).await;
        }

        let active = self
            .deployments
            .transition(
                deployment.id,
                &[DeploymentStatus::Deploying],
                DeploymentStatus::Active,
                None,
            )
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidState(format!(
                    "deployment {} changed state during activation",
                    deployment.id
                ))
            })?;

        tracing::info!("Deployment {} active with 100% traffic", active.id);
        self.notifications.emit(LifecycleEvent::new(
            EventKind::DeploymentActivated,
            active.id,
            &active.project_id,
            format!("Deployment {} is serving all traffic", active.image_ref),
        ));

        Ok(active)
    }

    async fn fail(&self, deployment: Deployment, reason: String) -> ServiceResult<Deployment> {
        tracing::error!("Deployment {} failed: {}", deployment.id, reason);

        let failed = self
            .deployments
            .transition(
                deployment.id,
                &[DeploymentStatus::Pending, DeploymentStatus::Deploying],
                DeploymentStatus::Failed,
                Some(&reason),
            )
            .await?
            .unwrap_or(deployment);

        self.notifications.emit(LifecycleEvent::new(
            EventKind::DeploymentFailed,
            failed.id,
            &failed.project_id,
            format!("Deployment {} failed: {}", failed.id, reason),
        ));

        Ok(failed)
    }
}
