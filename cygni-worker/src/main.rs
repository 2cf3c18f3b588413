//! Cygni Worker
//!
//! A stateless worker that turns queued builds into container images.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Podman: External build and push processes
//! - Services: Business logic (execution, log buffering)
//! - Scheduler: Claiming builds, lease renewal and result reporting
//!
//! The worker claims builds from the orchestrator queue, builds and pushes
//! images with podman, and streams logs back periodically.

mod config;
mod context;
mod execution;
mod podman;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::BuildPoller;
use crate::service::{ExecutionService, PodmanExecutionService};
use cygni_client::OrchestratorClient;

/// Per-request timeout for calls to the orchestrator
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cygni_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cygni Worker");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, orchestrator_url={}, registry={}",
        config.worker_id, config.orchestrator_url, config.image_registry
    );

    podman::check_podman_available()
        .await
        .context("Podman is required to run builds")?;

    // Initialize orchestrator client
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let client = Arc::new(OrchestratorClient::with_client(
        config.orchestrator_url.clone(),
        http,
    ));

    info!("Orchestrator client initialized");

    // The orchestrator may not be up yet when running in containers
    wait_for_orchestrator(&client).await?;

    let execution_service: Arc<dyn ExecutionService> =
        Arc::new(PodmanExecutionService::new(&config));

    let poller = BuildPoller::new(config.clone(), client, execution_service);

    info!("Worker initialized successfully");
    info!(
        "Poll interval: {:?}, Log send interval: {:?}, Lease renew interval: {:?}, Build timeout: {:?}",
        config.poll_interval,
        config.log_send_interval,
        config.lease_renew_interval,
        config.build_timeout
    );

    if let Err(e) = poller.run().await {
        error!("Poller error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Waits until the orchestrator answers its health check, with exponential
/// backoff
async fn wait_for_orchestrator(client: &OrchestratorClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.health().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Orchestrator reachable after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Orchestrator unreachable after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!(
                        "Failed to reach orchestrator at {}: {}",
                        client.base_url(),
                        e
                    ));
                }

                warn!(
                    "Orchestrator not reachable (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
