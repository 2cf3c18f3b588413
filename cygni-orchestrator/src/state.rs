//! Application wiring
//!
//! Builds the stores, adapters, services and controller from configuration
//! and bundles them into the state shared by every HTTP handler.

use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use crate::adapter::{
    EmptyMetricsReader, HttpTrafficRouter, InMemoryTrafficRouter, LogNotifier, MetricsReader,
    Notifications, Notifier, PrometheusMetricsReader, TrafficRouter, WebhookNotifier,
};
use crate::config::Config;
use crate::controller::{CanaryController, ControllerSettings};
use crate::repository::{
    BuildStore, CanaryStore, DeploymentStore, MemoryStore, PgBuildStore, PgCanaryStore,
    PgDeploymentStore,
};
use crate::service::{BuildService, DeploymentService, LogService, QueueSettings};

/// Persistence backends for each record type
pub struct Stores {
    pub builds: Arc<dyn BuildStore>,
    pub deployments: Arc<dyn DeploymentStore>,
    pub canaries: Arc<dyn CanaryStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            builds: Arc::new(PgBuildStore::new(pool.clone())),
            deployments: Arc::new(PgDeploymentStore::new(pool.clone())),
            canaries: Arc::new(PgCanaryStore::new(pool)),
        }
    }

    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            builds: store.clone(),
            deployments: store.clone(),
            canaries: store,
        }
    }
}

/// External system adapters
pub struct Adapters {
    pub router: Arc<dyn TrafficRouter>,
    pub metrics: Arc<dyn MetricsReader>,
    pub notifier: Arc<dyn Notifier>,
}

impl Adapters {
    /// Picks HTTP-backed adapters for every configured URL and in-process
    /// fallbacks for the rest
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.adapter_timeout).build()?;

        let router: Arc<dyn TrafficRouter> = match &config.traffic_router_url {
            Some(url) => Arc::new(HttpTrafficRouter::new(url, client.clone())),
            None => {
                tracing::warn!("TRAFFIC_ROUTER_URL not set; routing tables are kept in process");
                Arc::new(InMemoryTrafficRouter::new())
            }
        };

        let metrics: Arc<dyn MetricsReader> = match &config.prometheus_url {
            Some(url) => Arc::new(PrometheusMetricsReader::new(url, client.clone())),
            None => {
                tracing::warn!(
                    "PROMETHEUS_URL not set; canaries see no traffic and cannot auto-promote"
                );
                Arc::new(EmptyMetricsReader)
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url, client)),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            router,
            metrics,
            notifier,
        })
    }
}

/// State shared by the API handlers
#[derive(Clone)]
pub struct AppState {
    pub builds: Arc<BuildService>,
    pub deployments: Arc<DeploymentService>,
    pub canaries: Arc<CanaryController>,
    pub logs: Arc<LogService>,
    pub router: Arc<dyn TrafficRouter>,
}

impl AppState {
    pub fn assemble(config: &Config, stores: Stores, adapters: Adapters) -> Self {
        let notifications = Notifications::new(adapters.notifier);

        let canaries = Arc::new(CanaryController::new(
            stores.canaries,
            stores.deployments.clone(),
            adapters.router.clone(),
            adapters.metrics,
            notifications.clone(),
            ControllerSettings {
                eval_interval: config.canary_eval_interval,
                lookback: config.canary_lookback,
                adapter_timeout: config.adapter_timeout,
            },
        ));

        let deployments = Arc::new(DeploymentService::new(
            stores.deployments.clone(),
            adapters.router.clone(),
            canaries.clone(),
            notifications.clone(),
            config.adapter_timeout,
        ));

        let logs = Arc::new(LogService::new(stores.builds.clone()));

        let builds = Arc::new(BuildService::new(
            stores.builds,
            stores.deployments,
            deployments.clone(),
            logs.clone(),
            notifications,
            QueueSettings {
                lease: config.build_lease,
                max_attempts: config.build_max_attempts,
                retry_backoff: config.build_retry_backoff,
            },
        ));

        Self {
            builds,
            deployments,
            canaries,
            logs,
            router: adapters.router,
        }
    }
}
