//! Test fixtures: scripted adapters and a fully wired in-memory orchestrator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::build::{Build, BuildOutcome};
use cygni_core::domain::canary::{CanaryPolicy, WindowedMetrics};
use cygni_core::domain::deployment::Deployment;
use cygni_core::domain::routing::VariantWeight;
use cygni_core::dto::build::{CompleteBuild, SubmitBuild};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::adapter::notifier::testing::RecordingNotifier;
use crate::adapter::{AdapterError, InMemoryTrafficRouter, MetricsReader, TrafficRouter};
use crate::config::{Config, StoreBackend};
use crate::repository::MemoryStore;
use crate::state::{Adapters, AppState, Stores};

pub enum MetricsScript {
    Return(WindowedMetrics),
    Fail,
    /// Never answers within the adapter deadline
    Hang,
}

/// Metrics reader answering from a queue; empty metrics once it runs dry
#[derive(Default)]
pub struct ScriptedMetrics {
    script: Mutex<VecDeque<MetricsScript>>,
}

impl ScriptedMetrics {
    pub fn push(&self, step: MetricsScript) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn push_n(&self, n: usize, metrics: WindowedMetrics) {
        for _ in 0..n {
            self.push(MetricsScript::Return(metrics));
        }
    }
}

#[async_trait]
impl MetricsReader for ScriptedMetrics {
    async fn windowed_metrics(
        &self,
        _deployment_id: Uuid,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<WindowedMetrics, AdapterError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(MetricsScript::Return(m)) => Ok(m),
            Some(MetricsScript::Fail) => Err(AdapterError::Malformed("prometheus down".to_string())),
            Some(MetricsScript::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(WindowedMetrics::empty())
            }
            None => Ok(WindowedMetrics::empty()),
        }
    }
}

/// In-memory router that can be switched into failure
#[derive(Default)]
pub struct SwitchableRouter {
    pub inner: InMemoryTrafficRouter,
    pub failing: AtomicBool,
}

impl SwitchableRouter {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrafficRouter for SwitchableRouter {
    async fn set_weights(&self, project_id: &str, weights: &[VariantWeight]) -> Result<(), AdapterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Status {
                status: 503,
                body: "router unavailable".to_string(),
            });
        }
        self.inner.set_weights(project_id, weights).await
    }

    async fn current_weights(&self, project_id: &str) -> Result<Vec<VariantWeight>, AdapterError> {
        self.inner.current_weights(project_id).await
    }
}

pub fn healthy_metrics(requests: u64) -> WindowedMetrics {
    WindowedMetrics {
        success_rate: 0.999,
        error_rate: 0.001,
        latency_p50_ms: 40.0,
        latency_p95_ms: 120.0,
        latency_p99_ms: 200.0,
        request_count: requests,
    }
}

pub fn test_config() -> Config {
    Config {
        store: StoreBackend::Memory,
        // Tests drive evaluations directly
        canary_eval_interval: Duration::from_secs(3600),
        adapter_timeout: Duration::from_millis(50),
        build_retry_backoff: Duration::ZERO,
        ..Config::default()
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub router: Arc<SwitchableRouter>,
    pub metrics: Arc<ScriptedMetrics>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(SwitchableRouter::default());
        let metrics = Arc::new(ScriptedMetrics::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let state = AppState::assemble(
            &config,
            Stores {
                builds: store.clone(),
                deployments: store.clone(),
                canaries: store.clone(),
            },
            Adapters {
                router: router.clone(),
                metrics: metrics.clone(),
                notifier: notifier.clone(),
            },
        );

        Self {
            state,
            store,
            router,
            metrics,
            notifier,
        }
    }

    pub fn submission(project_id: &str, commit_sha: &str) -> SubmitBuild {
        SubmitBuild {
            project_id: project_id.to_string(),
            repository: format!("https://git.example.com/{}.git", project_id),
            commit_sha: commit_sha.to_string(),
            branch: Some("main".to_string()),
            ..SubmitBuild::default()
        }
    }

    /// Submits, claims and completes a build successfully
    pub async fn ship(
        &self,
        project_id: &str,
        commit_sha: &str,
        canary: Option<CanaryPolicy>,
    ) -> (Build, Deployment) {
        let mut req = Self::submission(project_id, commit_sha);
        req.canary = canary;
        let build = self.state.builds.submit(req).await.unwrap();

        let claimed = self.state.builds.claim("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.build_id, build.id);

        let build = self
            .state
            .builds
            .complete(
                build.id,
                CompleteBuild {
                    worker_id: "worker-1".to_string(),
                    lease_token: claimed.lease_token,
                    outcome: BuildOutcome::Succeeded {
                        image_ref: format!("registry.local/{}:{}", project_id, commit_sha),
                    },
                },
            )
            .await
            .unwrap();

        let deployment = self
            .state
            .deployments
            .list_by_project(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.build_id == build.id)
            .unwrap();

        (build, deployment)
    }

    /// Weight of a variant in the project's current routing table
    pub async fn weight_of(&self, project_id: &str, variant: Uuid) -> f64 {
        self.router
            .current_weights(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|w| w.variant_id == variant.to_string())
            .map_or(0.0, |w| w.weight)
    }
}
