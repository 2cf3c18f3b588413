//! Build poller
//!
//! Claims builds from the orchestrator queue and executes them.
//! Each build runs in its own task alongside a log sender and a lease keeper
//! that share the build's context.

use anyhow::{Context as AnyhowContext, Result};
use cygni_client::{ClaimedBuild, ClientError, OrchestratorClient};
use cygni_core::domain::build::BuildOutcome;
use cygni_core::domain::log::LogEntry;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::BuildContext;
use crate::execution::ExecutionResult;
use crate::service::ExecutionService;

/// Attempts for reporting a result before giving up on it
const REPORT_ATTEMPTS: u32 = 5;

/// What the worker tells the orchestrator once execution ends
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Complete(BuildOutcome),
    AckCancel { termination_error: Option<String> },
    /// The lease belongs to someone else; say nothing
    Abandon,
}

impl Report {
    pub fn for_result(result: ExecutionResult, lease_lost: bool) -> Self {
        if lease_lost {
            return Report::Abandon;
        }
        match result {
            ExecutionResult::Cancelled { termination_error } => {
                Report::AckCancel { termination_error }
            }
            other => match other.into_outcome() {
                Some(outcome) => Report::Complete(outcome),
                None => Report::AckCancel {
                    termination_error: None,
                },
            },
        }
    }
}

/// Build poller that continuously claims and executes builds
pub struct BuildPoller {
    config: Config,
    client: Arc<OrchestratorClient>,
    executor: Arc<dyn ExecutionService>,
    semaphore: Arc<Semaphore>,
}

impl BuildPoller {
    /// Creates a new build poller
    pub fn new(
        config: Config,
        client: Arc<OrchestratorClient>,
        executor: Arc<dyn ExecutionService>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_builds));
        Self {
            config,
            client,
            executor,
            semaphore,
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting build poller (interval: {:?}, max parallel builds: {})",
            self.config.poll_interval, self.config.max_parallel_builds
        );

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;

            debug!("Polling for queued builds");

            match self.poll_once().await {
                Ok(claimed) => {
                    if claimed > 0 {
                        info!("Claimed {} build(s) this cycle", claimed);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Claims builds while there is capacity and the queue is not empty
    async fn poll_once(&self) -> Result<usize> {
        let mut claimed = 0;

        while let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            let build = self
                .client
                .claim_build(&self.config.worker_id)
                .await
                .context("Failed to claim build")?;

            match build {
                Some(build) => {
                    info!(
                        "Claimed build {} (attempt {}, lease until {})",
                        build.build_id, build.attempt, build.lease_expires_at
                    );
                    self.spawn_build_task(build, permit);
                    claimed += 1;
                }
                None => {
                    debug!("No builds available");
                    break;
                }
            }
        }

        Ok(claimed)
    }

    /// Spawns a task to execute a single build
    fn spawn_build_task(&self, build: ClaimedBuild, permit: OwnedSemaphorePermit) {
        let client = Arc::clone(&self.client);
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();

        tokio::spawn(async move {
            let build_id = build.build_id;
            if let Err(e) = Self::execute_build(build, config, client, executor).await {
                error!("Failed to finish build {}: {:#}", build_id, e);
            }
            // Frees the slot for the next claim
            drop(permit);
        });
    }

    /// Executes a build, streaming logs and renewing the lease until it ends
    async fn execute_build(
        build: ClaimedBuild,
        config: Config,
        client: Arc<OrchestratorClient>,
        executor: Arc<dyn ExecutionService>,
    ) -> Result<()> {
        let build_id = build.build_id;
        let ctx = BuildContext::new(build_id, build.lease_token);

        let (stop_logs, logs_stopped) = oneshot::channel();
        let log_sender = Self::spawn_log_sender(
            Arc::clone(&ctx),
            Arc::clone(&client),
            config.worker_id.clone(),
            config.log_send_interval,
            logs_stopped,
        );
        let lease_keeper = Self::spawn_lease_keeper(
            Arc::clone(&ctx),
            Arc::clone(&client),
            config.worker_id.clone(),
            config.lease_renew_interval,
        );

        let result = executor.execute(&build, Arc::clone(&ctx)).await;

        lease_keeper.abort();
        // The sender flushes what is left before it exits
        let _ = stop_logs.send(());
        if let Err(e) = log_sender.await {
            warn!("Log sender for build {} panicked: {}", build_id, e);
        }

        match Report::for_result(result, ctx.lease_lost()) {
            Report::Abandon => {
                warn!(
                    "Lease on build {} was lost; abandoning without reporting",
                    build_id
                );
                Ok(())
            }
            Report::AckCancel { termination_error } => {
                let build = report_with_retry(build_id, "acknowledge cancellation", || {
                    client.ack_cancel(
                        build_id,
                        &config.worker_id,
                        ctx.lease_token,
                        termination_error.clone(),
                    )
                })
                .await?;
                info!("Build {} cancelled ({})", build_id, build.status);
                Ok(())
            }
            Report::Complete(outcome) => {
                let build = report_with_retry(build_id, "complete build", || {
                    client.complete_build(
                        build_id,
                        &config.worker_id,
                        ctx.lease_token,
                        outcome.clone(),
                    )
                })
                .await?;
                info!("Build {} reported, now {}", build_id, build.status);
                Ok(())
            }
        }
    }

    /// Spawns a background task to send logs periodically.
    /// Entries that fail to send are kept for the next attempt.
    fn spawn_log_sender(
        ctx: Arc<BuildContext>,
        client: Arc<OrchestratorClient>,
        worker_id: String,
        interval: Duration,
        mut stop: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            let mut pending: Vec<LogEntry> = Vec::new();

            loop {
                let stopping = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = &mut stop => true,
                };

                pending.extend(ctx.drain_logs());

                if ctx.lease_lost() {
                    debug!("Dropping {} logs for build {}", pending.len(), ctx.build_id);
                    return;
                }

                if !pending.is_empty() {
                    debug!("Sending {} logs for build {}", pending.len(), ctx.build_id);

                    match client
                        .send_logs(ctx.build_id, &worker_id, ctx.lease_token, pending.clone())
                        .await
                    {
                        Ok(()) => pending.clear(),
                        Err(e) if e.is_lease_lost() => {
                            warn!("Lease lost on build {} while sending logs", ctx.build_id);
                            ctx.mark_lease_lost();
                            return;
                        }
                        Err(e) => {
                            error!("Failed to send logs for build {}: {:#}", ctx.build_id, e);
                        }
                    }
                }

                if stopping {
                    if !pending.is_empty() {
                        warn!(
                            "Discarding {} unsent logs for build {}",
                            pending.len(),
                            ctx.build_id
                        );
                    }
                    return;
                }
            }
        })
    }

    /// Spawns a background task that renews the lease and watches for
    /// cancellation requests
    fn spawn_lease_keeper(
        ctx: Arc<BuildContext>,
        client: Arc<OrchestratorClient>,
        worker_id: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);

            loop {
                ticker.tick().await;

                match client
                    .heartbeat(ctx.build_id, &worker_id, ctx.lease_token)
                    .await
                {
                    Ok(ack) => {
                        debug!(
                            "Lease on build {} renewed until {:?}",
                            ctx.build_id, ack.lease_expires_at
                        );
                        if ack.cancel_requested && !ctx.is_cancelled() {
                            info!("Cancellation requested for build {}", ctx.build_id);
                            ctx.log_warning("Cancellation requested, stopping build");
                            ctx.request_cancel();
                        }
                    }
                    Err(e) if e.is_lease_lost() || e.is_not_found() => {
                        warn!("Lease on build {} lost: {}", ctx.build_id, e);
                        ctx.mark_lease_lost();
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to renew lease on build {}: {:#}", ctx.build_id, e);
                    }
                }
            }
        })
    }
}

/// Retries transient failures with exponential backoff. Other errors are
/// final: the orchestrator rejected the report.
async fn report_with_retry<T, F, Fut>(build_id: Uuid, what: &str, mut send: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ClientError>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match send().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < REPORT_ATTEMPTS => {
                warn!(
                    "Failed to {} for build {} (attempt {}/{}): {}",
                    what, build_id, attempt, REPORT_ATTEMPTS, e
                );
                time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to {} for build {}", what, build_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cygni_core::domain::build::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_success_is_completed() {
        let report = Report::for_result(
            ExecutionResult::Succeeded {
                image_ref: "registry.local/web:abc".into(),
            },
            false,
        );
        assert_eq!(
            report,
            Report::Complete(BuildOutcome::Succeeded {
                image_ref: "registry.local/web:abc".into()
            })
        );
    }

    #[test]
    fn test_cancellation_is_acknowledged() {
        let report = Report::for_result(
            ExecutionResult::Cancelled {
                termination_error: Some("kill failed".into()),
            },
            false,
        );
        assert_eq!(
            report,
            Report::AckCancel {
                termination_error: Some("kill failed".into())
            }
        );
    }

    #[test]
    fn test_timeout_is_reported_as_infrastructure_failure() {
        let report = Report::for_result(ExecutionResult::TimedOut { after_secs: 60 }, false);
        assert!(matches!(
            report,
            Report::Complete(BuildOutcome::Failed {
                kind: FailureKind::Infrastructure,
                ..
            })
        ));
    }

    #[test]
    fn test_lost_lease_reports_nothing() {
        let report = Report::for_result(ExecutionResult::build_logic("exit 1"), true);
        assert_eq!(report, Report::Abandon);
    }

    #[tokio::test]
    async fn test_report_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let value = report_with_retry(Uuid::nil(), "complete build", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::api_error(503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_report_does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = report_with_retry(Uuid::nil(), "complete build", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::api_error(409, r#"{"error":"lease lost","code":"LEASE_LOST"}"#)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
