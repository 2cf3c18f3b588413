//! Canary Controller
//!
//! Runs one control-loop task per running release, keyed by release id.
//! Every mutation of a release, automatic or operator-invoked, happens under
//! that release's lock, so an evaluation never interleaves with a manual
//! promote or rollback. Status writes are conditional on a non-terminal
//! current status; once a release is terminal, later writes are rejected.

pub mod policy;

use chrono::{DateTime, Utc};
use cygni_core::domain::canary::{
    CanaryMetricSample, CanaryPolicy, CanaryRelease, CanaryStatus, WindowedMetrics,
};
use cygni_core::domain::deployment::{Deployment, DeploymentStatus};
use cygni_core::domain::event::{EventKind, LifecycleEvent};
use cygni_core::domain::routing::{VariantWeight, canary_split, validate_split};
use cygni_core::dto::canary::{CanaryView, StartCanary, UpdateTraffic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::adapter::{MetricsReader, Notifications, TrafficRouter, with_deadline};
use crate::repository::{CanaryStore, DeploymentStore, StoreError};
use crate::service::error::{ServiceError, ServiceResult, codes};
use policy::Decision;

/// Control loop timing
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub eval_interval: Duration,
    pub lookback: Duration,
    pub adapter_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(60),
            lookback: Duration::from_secs(300),
            adapter_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one evaluation pass
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The metrics read failed or timed out; nothing was decided
    NoDecision,
    Hold,
    Advanced(f64),
    Promoted,
    RolledBack,
    Paused,
    /// The release was no longer running
    Inactive(CanaryStatus),
}

impl Evaluation {
    fn keeps_running(&self) -> bool {
        matches!(
            self,
            Evaluation::NoDecision | Evaluation::Hold | Evaluation::Advanced(_)
        )
    }
}

pub struct CanaryController {
    canaries: Arc<dyn CanaryStore>,
    deployments: Arc<dyn DeploymentStore>,
    router: Arc<dyn TrafficRouter>,
    metrics: Arc<dyn MetricsReader>,
    notifications: Notifications,
    settings: ControllerSettings,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    loops: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl CanaryController {
    pub fn new(
        canaries: Arc<dyn CanaryStore>,
        deployments: Arc<dyn DeploymentStore>,
        router: Arc<dyn TrafficRouter>,
        metrics: Arc<dyn MetricsReader>,
        notifications: Notifications,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            canaries,
            deployments,
            router,
            metrics,
            notifications,
            settings,
            locks: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Starting releases
    // =========================================================================

    /// Operator-initiated start for an existing deployment
    pub async fn start(self: &Arc<Self>, req: StartCanary) -> ServiceResult<CanaryRelease> {
        req.policy
            .validate()
            .map_err(|e| ServiceError::Validation(format!("canary policy: {}", e)))?;

        let deployment = self
            .deployments
            .find(req.deployment_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("deployment {}", req.deployment_id)))?;

        if !matches!(
            deployment.status,
            DeploymentStatus::Deploying | DeploymentStatus::Active
        ) {
            return Err(ServiceError::InvalidState(format!(
                "deployment {} is {}",
                deployment.id, deployment.status
            )));
        }

        let stable = self
            .deployments
            .latest_active(&deployment.project_id, &deployment.environment_id, deployment.id)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidState(format!(
                    "no active deployment of {}/{} to serve as the stable variant",
                    deployment.project_id, deployment.environment_id
                ))
            })?;

        self.launch(&deployment, &stable, req.policy).await
    }

    /// Creates a release, routes its initial split and starts its loop
    pub async fn launch(
        self: &Arc<Self>,
        deployment: &Deployment,
        stable: &Deployment,
        policy: CanaryPolicy,
    ) -> ServiceResult<CanaryRelease> {
        policy
            .validate()
            .map_err(|e| ServiceError::Validation(format!("canary policy: {}", e)))?;

        let release = CanaryRelease::new(
            deployment.id,
            deployment.project_id.clone(),
            stable.id,
            policy,
        )
        .map_err(|e| ServiceError::Validation(format!("canary policy: {}", e)))?;

        match self.canaries.insert(&release).await {
            Ok(()) => {}
            Err(StoreError::Conflict(message)) => {
                return Err(ServiceError::invariant(codes::CANARY_ALREADY_ACTIVE, message));
            }
            Err(e) => return Err(e.into()),
        }

        let weights = canary_split(
            &stable.variant_id(),
            &deployment.variant_id(),
            release.traffic_percentage,
        );
        if let Err(e) = self.route(&release.project_id, &weights).await {
            let reason = format!("failed to route initial canary traffic: {}", e);
            self.canaries
                .transition(
                    release.id,
                    &[CanaryStatus::Running],
                    CanaryStatus::RolledBack,
                    Some(&reason),
                    Some(Utc::now()),
                )
                .await?;
            return Err(e);
        }

        tracing::info!(
            "Canary {} started for deployment {} at {}% (stable {})",
            release.id,
            deployment.id,
            release.traffic_percentage,
            stable.id
        );
        self.notifications.emit(
            LifecycleEvent::new(
                EventKind::CanaryStarted,
                release.id,
                &release.project_id,
                format!(
                    "Canary of {} started at {}% traffic",
                    deployment.image_ref, release.traffic_percentage
                ),
            )
            .with_details(serde_json::json!({
                "deployment_id": deployment.id,
                "stable_deployment_id": stable.id,
                "scheduled_end_at": release.scheduled_end_at,
            })),
        );

        self.spawn_loop(release.id);
        Ok(release)
    }

    /// Restarts loops for releases left running by a previous process
    pub async fn resume_running(self: &Arc<Self>) -> ServiceResult<usize> {
        let running = self.canaries.list_running().await?;
        for release in &running {
            tracing::info!("Resuming control loop for canary {}", release.id);
            self.spawn_loop(release.id);
        }
        Ok(running.len())
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    fn spawn_loop(self: &Arc<Self>, id: Uuid) {
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            if loops.contains_key(&id) {
                return;
            }
            loops.insert(id, stop_tx);
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run_loop(id, stop_rx).await });
    }

    async fn run_loop(self: Arc<Self>, id: Uuid, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.eval_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            match self.evaluate(id).await {
                Ok(outcome) if outcome.keeps_running() => {
                    tracing::debug!("Canary {} evaluation: {:?}", id, outcome);
                }
                Ok(outcome) => {
                    tracing::info!("Canary {} loop finished: {:?}", id, outcome);
                    break;
                }
                Err(ServiceError::NotFound(_)) => {
                    tracing::warn!("Canary {} disappeared; stopping its loop", id);
                    break;
                }
                Err(e) => tracing::warn!("Canary {} evaluation failed: {}", id, e),
            }
        }

        self.forget(id);
    }

    /// One pass of the control loop: read the window, persist the sample,
    /// decide and apply
    pub async fn evaluate(&self, id: Uuid) -> ServiceResult<Evaluation> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let release = self.find(id).await?;
        if release.status != CanaryStatus::Running {
            return Ok(Evaluation::Inactive(release.status));
        }

        let now = Utc::now();
        let from = now - chrono::Duration::from_std(self.settings.lookback)
            .unwrap_or(chrono::Duration::zero());
        let metrics = match with_deadline(
            self.settings.adapter_timeout,
            self.metrics.windowed_metrics(release.deployment_id, from, now),
        )
        .await
        {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(
                    "Metrics read for canary {} failed, no decision this cycle: {}",
                    id,
                    e
                );
                return Ok(Evaluation::NoDecision);
            }
        };

        let sample = CanaryMetricSample::from_metrics(id, now, &metrics);
        self.canaries.append_sample(&sample).await?;

        let window = release.policy.rollback_after_breaches.max(1) as usize;
        let recent = self.canaries.recent_samples(id, window).await?;

        match policy::evaluate(&release, &recent, now) {
            Decision::Rollback(breach) => {
                self.apply_rollback(&release, breach.to_string()).await?;
                Ok(Evaluation::RolledBack)
            }
            Decision::Promote(reason) => {
                self.apply_promote(&release, reason).await?;
                Ok(Evaluation::Promoted)
            }
            Decision::Advance(percentage) => {
                self.apply_traffic(&release, percentage).await?;
                Ok(Evaluation::Advanced(percentage))
            }
            Decision::Pause(reason) => {
                self.apply_pause(&release, reason).await?;
                Ok(Evaluation::Paused)
            }
            Decision::Hold => Ok(Evaluation::Hold),
        }
    }

    // =========================================================================
    // Operator controls
    // =========================================================================

    pub async fn promote(&self, id: Uuid) -> ServiceResult<CanaryRelease> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let release = self.find_active(id).await?;
        self.apply_promote(&release, "promoted by operator".to_string())
            .await
    }

    pub async fn rollback(&self, id: Uuid, reason: Option<String>) -> ServiceResult<CanaryRelease> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let release = self.find_active(id).await?;
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .map(|r| format!("rolled back by operator: {}", r))
            .unwrap_or_else(|| "rolled back by operator".to_string());
        self.apply_rollback(&release, reason).await
    }

    /// Stops automatic decisions. Pausing a paused release is a no-op.
    pub async fn pause(&self, id: Uuid) -> ServiceResult<CanaryRelease> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let release = self.find_active(id).await?;
        if release.status == CanaryStatus::Paused {
            return Ok(release);
        }
        self.apply_pause(&release, "paused by operator".to_string())
            .await
    }

    /// Sets the canary/stable split. The pair must sum to 100; nothing is
    /// clamped.
    pub async fn update_traffic(&self, id: Uuid, req: UpdateTraffic) -> ServiceResult<CanaryRelease> {
        validate_split(req.canary_percentage, req.stable_percentage).map_err(|e| {
            ServiceError::invariant(codes::TRAFFIC_WEIGHTS_INVALID, e.to_string())
        })?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let release = self.find_active(id).await?;
        self.apply_traffic(&release, req.canary_percentage).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> ServiceResult<CanaryRelease> {
        self.find(id).await
    }

    /// Current state with latest and rolling-average samples
    pub async fn status(&self, id: Uuid) -> ServiceResult<CanaryView> {
        let release = self.find(id).await?;

        // Samples that fall inside one lookback window
        let per_window = (self.settings.lookback.as_secs()
            / self.settings.eval_interval.as_secs().max(1))
        .max(1) as usize;
        let window = self.canaries.recent_samples(id, per_window).await?;
        let sample_count = self.canaries.count_samples(id).await?;

        Ok(view(release, window, sample_count, Utc::now()))
    }

    pub async fn list_for_deployment(&self, deployment_id: Uuid) -> ServiceResult<Vec<CanaryRelease>> {
        Ok(self.canaries.list_by_deployment(deployment_id).await?)
    }

    // =========================================================================
    // Transitions (callers hold the release lock)
    // =========================================================================

    async fn apply_promote(&self, release: &CanaryRelease, reason: String) -> ServiceResult<CanaryRelease> {
        let weights = [VariantWeight::new(release.deployment_id.to_string(), 100.0)];
        self.route(&release.project_id, &weights).await?;

        let promoted = self
            .canaries
            .transition(
                release.id,
                &[CanaryStatus::Running, CanaryStatus::Paused],
                CanaryStatus::Promoted,
                Some(&reason),
                Some(Utc::now()),
            )
            .await?
            .ok_or_else(|| self.already_terminal(release.id))?;

        // An already active deployment stays active
        self.deployments
            .transition(
                release.deployment_id,
                &[DeploymentStatus::Deploying],
                DeploymentStatus::Active,
                None,
            )
            .await?;

        self.stop_loop(release.id);
        tracing::info!("Canary {} promoted: {}", release.id, reason);
        self.notifications.emit(
            LifecycleEvent::new(
                EventKind::CanaryPromoted,
                release.id,
                &release.project_id,
                format!("Canary promoted to 100% traffic: {}", reason),
            )
            .with_details(serde_json::json!({ "deployment_id": release.deployment_id })),
        );

        Ok(promoted)
    }

    async fn apply_rollback(&self, release: &CanaryRelease, reason: String) -> ServiceResult<CanaryRelease> {
        let weights = [VariantWeight::new(release.stable_deployment_id.to_string(), 100.0)];
        self.route(&release.project_id, &weights).await?;

        let rolled_back = self
            .canaries
            .transition(
                release.id,
                &[CanaryStatus::Running, CanaryStatus::Paused],
                CanaryStatus::RolledBack,
                Some(&reason),
                Some(Utc::now()),
            )
            .await?
            .ok_or_else(|| self.already_terminal(release.id))?;

        self.deployments
            .transition(
                release.deployment_id,
                &[DeploymentStatus::Deploying, DeploymentStatus::Active],
                DeploymentStatus::RolledBack,
                Some(&reason),
            )
            .await?;

        self.stop_loop(release.id);
        tracing::warn!("Canary {} rolled back: {}", release.id, reason);
        self.notifications.emit(
            LifecycleEvent::new(
                EventKind::CanaryRolledBack,
                release.id,
                &release.project_id,
                format!("Canary rolled back: {}", reason),
            )
            .with_details(serde_json::json!({
                "deployment_id": release.deployment_id,
                "stable_deployment_id": release.stable_deployment_id,
                "reason": reason,
            })),
        );

        Ok(rolled_back)
    }

    async fn apply_pause(&self, release: &CanaryRelease, reason: String) -> ServiceResult<CanaryRelease> {
        let paused = self
            .canaries
            .transition(
                release.id,
                &[CanaryStatus::Running],
                CanaryStatus::Paused,
                Some(&reason),
                None,
            )
            .await?
            .ok_or_else(|| self.already_terminal(release.id))?;

        self.stop_loop(release.id);
        tracing::info!("Canary {} paused: {}", release.id, reason);
        self.notifications.emit(LifecycleEvent::new(
            EventKind::CanaryPaused,
            release.id,
            &release.project_id,
            format!("Canary paused, operator action required: {}", reason),
        ));

        Ok(paused)
    }

    async fn apply_traffic(&self, release: &CanaryRelease, percentage: f64) -> ServiceResult<CanaryRelease> {
        validate_split(percentage, 100.0 - percentage).map_err(|e| {
            ServiceError::invariant(codes::TRAFFIC_WEIGHTS_INVALID, e.to_string())
        })?;

        let weights = canary_split(
            &release.stable_deployment_id.to_string(),
            &release.deployment_id.to_string(),
            percentage,
        );
        self.route(&release.project_id, &weights).await?;

        let updated = self
            .canaries
            .set_traffic(release.id, percentage)
            .await?
            .ok_or_else(|| self.already_terminal(release.id))?;

        tracing::info!(
            "Canary {} traffic {}% -> {}%",
            release.id,
            release.traffic_percentage,
            percentage
        );
        self.notifications.emit(LifecycleEvent::new(
            EventKind::CanaryTrafficShifted,
            release.id,
            &release.project_id,
            format!(
                "Canary traffic shifted from {}% to {}%",
                release.traffic_percentage, percentage
            ),
        ));

        Ok(updated)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn route(&self, project_id: &str, weights: &[VariantWeight]) -> ServiceResult<()> {
        with_deadline(
            self.settings.adapter_timeout,
            self.router.set_weights(project_id, weights),
        )
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> ServiceResult<CanaryRelease> {
        self.canaries
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("canary {}", id)))
    }

    async fn find_active(&self, id: Uuid) -> ServiceResult<CanaryRelease> {
        let release = self.find(id).await?;
        if release.status.is_terminal() {
            return Err(self.already_terminal(id));
        }
        Ok(release)
    }

    fn already_terminal(&self, id: Uuid) -> ServiceError {
        ServiceError::InvalidState(format!("canary {} has already finished", id))
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    fn stop_loop(&self, id: Uuid) {
        if let Some(stop) = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            let _ = stop.send(true);
        }
    }

    fn forget(&self, id: Uuid) {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        // Keep the lock while anyone else still holds or waits on it
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    /// Number of releases with a live control loop
    pub fn active_loops(&self) -> usize {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn view(
    release: CanaryRelease,
    window: Vec<CanaryMetricSample>,
    sample_count: usize,
    now: DateTime<Utc>,
) -> CanaryView {
    let end = release.completed_at.unwrap_or(now);
    let elapsed_seconds = (end - release.started_at).num_seconds().max(0);
    let remaining_seconds = if release.status.is_terminal() {
        0
    } else {
        (release.scheduled_end_at - now).num_seconds().max(0)
    };

    CanaryView {
        latest_sample: window.first().cloned(),
        rolling_average: WindowedMetrics::average(&window),
        sample_count,
        elapsed_seconds,
        remaining_seconds,
        release,
    }
}
