//! Log Service
//!
//! Incremental build log capture. Batches from the lease holder are persisted
//! and fanned out to live subscribers, so a running build can be followed
//! before it finishes.

use cygni_core::domain::build::{Build, BuildStatus};
use cygni_core::domain::log::LogEntry;
use cygni_core::dto::log::LogBatch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use crate::repository::BuildStore;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Per-build broadcast channels for live log followers
#[derive(Default)]
pub struct LiveLogs {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<LogEntry>>>,
}

impl LiveLogs {
    pub fn subscribe(&self, build_id: Uuid) -> broadcast::Receiver<LogEntry> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(build_id)
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, build_id: Uuid, entries: &[LogEntry]) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(&build_id) {
            for entry in entries {
                // No receivers is fine
                let _ = tx.send(entry.clone());
            }
        }
    }

    /// Ends every live stream of a build
    pub fn close(&self, build_id: Uuid) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&build_id);
    }
}

/// Where a live log follower should start
pub struct LiveFollow {
    pub snapshot: Vec<LogEntry>,
    /// `None` once the build is finished and no more output can arrive
    pub updates: Option<broadcast::Receiver<LogEntry>>,
}

pub struct LogService {
    builds: Arc<dyn BuildStore>,
    live: LiveLogs,
}

impl LogService {
    pub fn new(builds: Arc<dyn BuildStore>) -> Self {
        Self {
            builds,
            live: LiveLogs::default(),
        }
    }

    /// Appends a batch sent by the worker holding the build's lease.
    /// A cancelled build still accepts output from its last lease holder
    /// until the cancellation is acknowledged.
    pub async fn append(&self, build_id: Uuid, batch: LogBatch) -> ServiceResult<()> {
        validate_log_entries(&batch.entries)?;

        let build = self
            .builds
            .find(build_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("build {}", build_id)))?;

        let accepting = match build.status {
            BuildStatus::Running => true,
            BuildStatus::Cancelled => build.cancel_requested,
            _ => false,
        };
        if !accepting || !build.is_leased_by(&batch.worker_id, batch.lease_token) {
            return Err(ServiceError::LeaseLost(build_id));
        }

        if batch.entries.is_empty() {
            return Ok(());
        }

        self.builds.append_logs(build_id, &batch.entries).await?;
        self.live.publish(build_id, &batch.entries);

        tracing::debug!(
            "Added {} log entries for build: {}",
            batch.entries.len(),
            build_id
        );

        Ok(())
    }

    /// Appends an orchestrator-side entry, such as a retry notice
    pub async fn record(&self, build_id: Uuid, entry: LogEntry) -> ServiceResult<()> {
        let entries = [entry];
        self.builds.append_logs(build_id, &entries).await?;
        self.live.publish(build_id, &entries);
        Ok(())
    }

    pub async fn entries(&self, build_id: Uuid) -> ServiceResult<Vec<LogEntry>> {
        Ok(self.builds.logs(build_id).await?)
    }

    /// Stored entries plus a live receiver for a build that can still log.
    /// The build is read after subscribing, so a build that finished in
    /// between gets no receiver instead of one nobody will close.
    pub async fn follow(&self, build_id: Uuid) -> ServiceResult<LiveFollow> {
        let receiver = self.live.subscribe(build_id);
        let build = self
            .builds
            .find(build_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("build {}", build_id)))?;

        let updates = if can_still_log(&build) {
            Some(receiver)
        } else {
            drop(receiver);
            self.live.close(build_id);
            None
        };

        let snapshot = self.builds.logs(build_id).await?;
        Ok(LiveFollow { snapshot, updates })
    }

    /// Ends live streams once a build can produce no more output
    pub fn close(&self, build_id: Uuid) {
        self.live.close(build_id);
    }
}

/// Running builds log, and so does a cancelled one until its worker acknowledges
fn can_still_log(build: &Build) -> bool {
    !build.status.is_terminal() || build.cancel_requested
}

// =============================================================================
// Validation
// =============================================================================

fn validate_log_entries(entries: &[LogEntry]) -> ServiceResult<()> {
    const MAX_MESSAGE_LENGTH: usize = 10_000;
    const MAX_BATCH_SIZE: usize = 1000;

    if entries.len() > MAX_BATCH_SIZE {
        return Err(ServiceError::Validation(format!(
            "Too many log entries in batch (max: {})",
            MAX_BATCH_SIZE
        )));
    }

    for (i, entry) in entries.iter().enumerate() {
        if entry.message.len() > MAX_MESSAGE_LENGTH {
            return Err(ServiceError::Validation(format!(
                "Log entry {} message too long (max: {} chars)",
                i, MAX_MESSAGE_LENGTH
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use chrono::{Duration, Utc};
    use cygni_core::domain::build::BuildJob;
    use cygni_core::domain::log::LogLevel;

    #[test]
    fn test_validate_log_entries_too_many() {
        let entries: Vec<LogEntry> = (0..1001)
            .map(|i| LogEntry::new(LogLevel::Info, format!("Message {}", i)))
            .collect();

        let result = validate_log_entries(&entries);
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_validate_log_entries_message_too_long() {
        let entries = vec![LogEntry::new(LogLevel::Info, "x".repeat(10_001))];

        let result = validate_log_entries(&entries);
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    async fn running_build(store: &Arc<MemoryStore>) -> Build {
        let build = queued_build(store).await;
        let now = Utc::now();
        store
            .claim_next("worker-1", now, now + Duration::seconds(60))
            .await
            .unwrap()
            .filter(|claimed| claimed.id == build.id)
            .unwrap()
    }

    async fn queued_build(store: &Arc<MemoryStore>) -> Build {
        let job = BuildJob {
            project_id: "shop".to_string(),
            repository: "repo".to_string(),
            commit_sha: "abc123".to_string(),
            branch: None,
            context_location: "repo".to_string(),
            manifest_path: "Containerfile".to_string(),
            build_args: HashMap::new(),
        };
        let build = Build::new(job, "production".to_string(), None);
        BuildStore::insert(store.as_ref(), &build).await.unwrap();
        build
    }

    #[tokio::test]
    async fn test_live_followers_receive_appended_entries() {
        let store = Arc::new(MemoryStore::new());
        let service = LogService::new(store.clone());
        let build = running_build(&store).await;
        let token = build.lease_token.unwrap();

        let batch = |msg: &str| LogBatch {
            worker_id: "worker-1".to_string(),
            lease_token: token,
            entries: vec![LogEntry::new(LogLevel::Info, msg)],
        };

        service.append(build.id, batch("STEP 1/3")).await.unwrap();

        let mut follow = service.follow(build.id).await.unwrap();
        assert_eq!(follow.snapshot.len(), 1);

        service.append(build.id, batch("STEP 2/3")).await.unwrap();
        let live = follow.updates.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(live.message, "STEP 2/3");

        service.close(build.id);
        assert!(follow.updates.unwrap().recv().await.is_err());
    }

    #[tokio::test]
    async fn test_stale_lease_token_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let service = LogService::new(store.clone());
        let build = running_build(&store).await;

        let result = service
            .append(
                build.id,
                LogBatch {
                    worker_id: "worker-1".to_string(),
                    lease_token: Uuid::new_v4(),
                    entries: vec![LogEntry::new(LogLevel::Info, "late output")],
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::LeaseLost(_))));
        assert!(service.entries(build.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_following_a_finished_build_ends_immediately() {
        let store = Arc::new(MemoryStore::new());
        let service = LogService::new(store.clone());
        let build = queued_build(&store).await;

        // Finished after the caller looked the build up
        let cancelled = BuildStore::cancel(store.as_ref(), build.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(!cancelled.cancel_requested);

        let follow = service.follow(build.id).await.unwrap();
        assert!(follow.updates.is_none());
        assert!(service.live.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_following_unknown_build_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let service = LogService::new(store);

        let result = service.follow(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
