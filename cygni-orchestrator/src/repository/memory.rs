//! In-memory store
//!
//! Implements every store trait behind one mutex with the same conditional
//! semantics as the Postgres statements. Used with `ORCHESTRATOR_STORE=memory`
//! and throughout the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::build::{Build, BuildStatus};
use cygni_core::domain::canary::{CanaryMetricSample, CanaryRelease, CanaryStatus};
use cygni_core::domain::deployment::{Deployment, DeploymentStatus};
use cygni_core::domain::log::LogEntry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{BuildStore, CanaryStore, DeploymentStore, Finish, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    builds: HashMap<Uuid, Build>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
    deployments: HashMap<Uuid, Deployment>,
    canaries: HashMap<Uuid, CanaryRelease>,
    samples: HashMap<Uuid, Vec<CanaryMetricSample>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Builds
// =============================================================================

#[async_trait]
impl BuildStore for MemoryStore {
    async fn insert(&self, build: &Build) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.builds.contains_key(&build.id) {
            return Err(StoreError::Conflict(format!("build {} already exists", build.id)));
        }
        inner.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Build>> {
        Ok(self.lock().builds.get(&id).cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .lock()
            .builds
            .values()
            .filter(|b| b.job.project_id == project_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(builds)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();

        let next = inner
            .builds
            .values()
            .filter(|b| match b.status {
                BuildStatus::Pending => b.available_at <= now,
                BuildStatus::Running => b.lease_expires_at.is_some_and(|t| t < now),
                _ => false,
            })
            .min_by_key(|b| b.requested_at)
            .map(|b| b.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(build) = inner.builds.get_mut(&id) else {
            return Ok(None);
        };

        build.status = BuildStatus::Running;
        build.worker_id = Some(worker_id.to_string());
        build.lease_token = Some(Uuid::new_v4());
        build.lease_expires_at = Some(lease_until);
        build.attempts += 1;
        build.started_at.get_or_insert(now);
        build.cancel_requested = false;

        Ok(Some(build.clone()))
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        lease_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .get_mut(&id)
            .filter(|b| b.status == BuildStatus::Running && b.lease_token == Some(lease_token))
            .map(|b| {
                b.lease_expires_at = Some(lease_until);
                b.clone()
            }))
    }

    async fn finish(
        &self,
        id: Uuid,
        lease_token: Option<Uuid>,
        finish: Finish,
    ) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .get_mut(&id)
            .filter(|b| !b.status.is_terminal())
            .filter(|b| lease_token.is_none() || b.lease_token == lease_token)
            .map(|b| {
                b.status = finish.status;
                if finish.image_ref.is_some() {
                    b.image_ref = finish.image_ref;
                }
                b.failure_reason = finish.failure_reason;
                b.completed_at = Some(finish.completed_at);
                b.lease_expires_at = None;
                b.clone()
            }))
    }

    async fn requeue(
        &self,
        id: Uuid,
        lease_token: Uuid,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .get_mut(&id)
            .filter(|b| b.status == BuildStatus::Running && b.lease_token == Some(lease_token))
            .map(|b| {
                b.status = BuildStatus::Pending;
                b.available_at = available_at;
                b.failure_reason = Some(reason.to_string());
                b.worker_id = None;
                b.lease_token = None;
                b.lease_expires_at = None;
                b.clone()
            }))
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .get_mut(&id)
            .filter(|b| !b.status.is_terminal())
            .map(|b| {
                b.cancel_requested = b.status == BuildStatus::Running;
                b.status = BuildStatus::Cancelled;
                b.failure_reason
                    .get_or_insert_with(|| "cancelled by request".to_string());
                b.completed_at = Some(now);
                b.lease_expires_at = None;
                b.clone()
            }))
    }

    async fn clear_cancel_request(&self, id: Uuid, lease_token: Uuid) -> StoreResult<Option<Build>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .get_mut(&id)
            .filter(|b| b.status == BuildStatus::Cancelled && b.lease_token == Some(lease_token))
            .map(|b| {
                b.cancel_requested = false;
                b.clone()
            }))
    }

    async fn expire_cancel_requests(&self, cancelled_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.lock();
        Ok(inner
            .builds
            .values_mut()
            .filter(|b| {
                b.status == BuildStatus::Cancelled
                    && b.cancel_requested
                    && b.completed_at.is_some_and(|at| at < cancelled_before)
            })
            .map(|b| {
                b.cancel_requested = false;
                b.id
            })
            .collect())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.deployments.values().any(|d| d.build_id == id) {
            return Err(StoreError::Conflict(format!("build {} still has deployments", id)));
        }
        inner.logs.remove(&id);
        Ok(inner.builds.remove(&id).is_some())
    }

    async fn append_logs(&self, id: Uuid, entries: &[LogEntry]) -> StoreResult<()> {
        self.lock()
            .logs
            .entry(id)
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn logs(&self, id: Uuid) -> StoreResult<Vec<LogEntry>> {
        Ok(self.lock().logs.get(&id).cloned().unwrap_or_default())
    }
}

// =============================================================================
// Deployments
// =============================================================================

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, deployment: &Deployment) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.builds.contains_key(&deployment.build_id) {
            return Err(StoreError::Conflict(format!(
                "build {} does not exist",
                deployment.build_id
            )));
        }
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Deployment>> {
        Ok(self.lock().deployments.get(&id).cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> StoreResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .lock()
            .deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn list_by_build(&self, build_id: Uuid) -> StoreResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .lock()
            .deployments
            .values()
            .filter(|d| d.build_id == build_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn latest_active(
        &self,
        project_id: &str,
        environment_id: &str,
        exclude: Uuid,
    ) -> StoreResult<Option<Deployment>> {
        Ok(self
            .lock()
            .deployments
            .values()
            .filter(|d| {
                d.project_id == project_id
                    && d.environment_id == environment_id
                    && d.status == DeploymentStatus::Active
                    && d.id != exclude
            })
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<&str>,
    ) -> StoreResult<Option<Deployment>> {
        let mut inner = self.lock();
        Ok(inner
            .deployments
            .get_mut(&id)
            .filter(|d| from.contains(&d.status))
            .map(|d| {
                d.status = to;
                if let Some(reason) = reason {
                    d.reason = Some(reason.to_string());
                }
                d.updated_at = Utc::now();
                d.clone()
            }))
    }

    async fn delete_by_build(&self, build_id: Uuid) -> StoreResult<u64> {
        let mut inner = self.lock();
        let ids: Vec<Uuid> = inner
            .deployments
            .values()
            .filter(|d| d.build_id == build_id)
            .map(|d| d.id)
            .collect();

        let canary_ids: Vec<Uuid> = inner
            .canaries
            .values()
            .filter(|c| ids.contains(&c.deployment_id))
            .map(|c| c.id)
            .collect();
        for canary_id in canary_ids {
            inner.canaries.remove(&canary_id);
            inner.samples.remove(&canary_id);
        }

        for id in &ids {
            inner.deployments.remove(id);
        }
        Ok(ids.len() as u64)
    }
}

// =============================================================================
// Canaries
// =============================================================================

#[async_trait]
impl CanaryStore for MemoryStore {
    async fn insert(&self, release: &CanaryRelease) -> StoreResult<()> {
        let mut inner = self.lock();
        let active = inner
            .canaries
            .values()
            .any(|c| c.deployment_id == release.deployment_id && c.status.is_active());
        if active && release.status.is_active() {
            return Err(StoreError::Conflict(format!(
                "deployment {} already has an active canary",
                release.deployment_id
            )));
        }
        inner.canaries.insert(release.id, release.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<CanaryRelease>> {
        Ok(self.lock().canaries.get(&id).cloned())
    }

    async fn list_by_deployment(&self, deployment_id: Uuid) -> StoreResult<Vec<CanaryRelease>> {
        let mut releases: Vec<CanaryRelease> = self
            .lock()
            .canaries
            .values()
            .filter(|c| c.deployment_id == deployment_id)
            .cloned()
            .collect();
        releases.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(releases)
    }

    async fn list_running(&self) -> StoreResult<Vec<CanaryRelease>> {
        let mut releases: Vec<CanaryRelease> = self
            .lock()
            .canaries
            .values()
            .filter(|c| c.status == CanaryStatus::Running)
            .cloned()
            .collect();
        releases.sort_by_key(|c| c.started_at);
        Ok(releases)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[CanaryStatus],
        to: CanaryStatus,
        reason: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<CanaryRelease>> {
        let mut inner = self.lock();
        Ok(inner
            .canaries
            .get_mut(&id)
            .filter(|c| from.contains(&c.status))
            .map(|c| {
                c.status = to;
                if let Some(reason) = reason {
                    c.reason = Some(reason.to_string());
                }
                if completed_at.is_some() {
                    c.completed_at = completed_at;
                }
                c.clone()
            }))
    }

    async fn set_traffic(&self, id: Uuid, traffic_percentage: f64) -> StoreResult<Option<CanaryRelease>> {
        let mut inner = self.lock();
        Ok(inner
            .canaries
            .get_mut(&id)
            .filter(|c| c.status.is_active())
            .map(|c| {
                c.traffic_percentage = traffic_percentage;
                c.clone()
            }))
    }

    async fn append_sample(&self, sample: &CanaryMetricSample) -> StoreResult<()> {
        self.lock()
            .samples
            .entry(sample.canary_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn recent_samples(&self, canary_id: Uuid, limit: usize) -> StoreResult<Vec<CanaryMetricSample>> {
        Ok(self
            .lock()
            .samples
            .get(&canary_id)
            .map(|s| s.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count_samples(&self, canary_id: Uuid) -> StoreResult<usize> {
        Ok(self.lock().samples.get(&canary_id).map_or(0, Vec::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cygni_core::domain::build::BuildJob;
    use cygni_core::domain::canary::CanaryPolicy;

    fn job() -> BuildJob {
        BuildJob {
            project_id: "shop".to_string(),
            repository: "https://git.example.com/shop.git".to_string(),
            commit_sha: "abc123".to_string(),
            branch: Some("main".to_string()),
            context_location: "https://git.example.com/shop.git".to_string(),
            manifest_path: "Containerfile".to_string(),
            build_args: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = MemoryStore::new();
        let build = Build::new(job(), "production".to_string(), None);
        BuildStore::insert(&store, &build).await.unwrap();

        let now = Utc::now();
        let first = store
            .claim_next("worker-a", now, now + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attempts, 1);

        // Lease still held
        let none = store
            .claim_next("worker-b", now + Duration::seconds(30), now + Duration::seconds(90))
            .await
            .unwrap();
        assert!(none.is_none());

        // Lease expired: another worker takes over with a new token
        let later = now + Duration::seconds(61);
        let second = store
            .claim_next("worker-b", later, later + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.worker_id.as_deref(), Some("worker-b"));
        assert_eq!(second.attempts, 2);
        assert_ne!(second.lease_token, first.lease_token);

        // The first worker's token no longer renews
        let renewed = store
            .renew_lease(build.id, first.lease_token.unwrap(), later + Duration::seconds(120))
            .await
            .unwrap();
        assert!(renewed.is_none());
    }

    #[tokio::test]
    async fn test_requeued_build_waits_for_backoff() {
        let store = MemoryStore::new();
        let build = Build::new(job(), "production".to_string(), None);
        BuildStore::insert(&store, &build).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim_next("w", now, now + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        let token = claimed.lease_token.unwrap();

        store
            .requeue(build.id, token, now + Duration::seconds(10), "registry unreachable")
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .claim_next("w", now + Duration::seconds(5), now + Duration::seconds(65))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_next("w", now + Duration::seconds(11), now + Duration::seconds(71))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_terminal_build_is_not_overwritten() {
        let store = MemoryStore::new();
        let build = Build::new(job(), "production".to_string(), None);
        BuildStore::insert(&store, &build).await.unwrap();

        let cancelled = store.cancel(build.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(!cancelled.cancel_requested);

        let finished = store
            .finish(build.id, None, Finish::success("registry/shop:abc123".to_string()))
            .await
            .unwrap();
        assert!(finished.is_none());
        assert!(store.cancel(build.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_active_canary_conflicts() {
        let store = MemoryStore::new();
        let deployment_id = Uuid::new_v4();
        let first = CanaryRelease::new(
            deployment_id,
            "shop".to_string(),
            Uuid::new_v4(),
            CanaryPolicy::default(),
        )
        .unwrap();
        CanaryStore::insert(&store, &first).await.unwrap();

        let second = CanaryRelease::new(
            deployment_id,
            "shop".to_string(),
            Uuid::new_v4(),
            CanaryPolicy::default(),
        )
        .unwrap();
        assert!(matches!(
            CanaryStore::insert(&store, &second).await,
            Err(StoreError::Conflict(_))
        ));

        CanaryStore::transition(
            &store,
            first.id,
            &[CanaryStatus::Running],
            CanaryStatus::RolledBack,
            Some("manual"),
            Some(Utc::now()),
        )
        .await
        .unwrap()
        .unwrap();
        CanaryStore::insert(&store, &second).await.unwrap();
    }
}
