//! Execution context for a claimed build
//!
//! Holds the state shared between the executor, the log sender and the lease
//! keeper while one build runs:
//! - Log buffer for collecting output
//! - Cooperative cancel signal
//! - Whether the lease was lost

use cygni_core::domain::log::{LogEntry, LogLevel};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use uuid::Uuid;

use crate::service::{InMemoryLogBuffer, LogBufferService};

pub struct BuildContext {
    pub build_id: Uuid,
    pub lease_token: Uuid,
    logs: Arc<dyn LogBufferService>,
    cancel: watch::Sender<bool>,
    lease_lost: AtomicBool,
}

impl BuildContext {
    pub fn new(build_id: Uuid, lease_token: Uuid) -> Arc<Self> {
        Self::with_buffer(build_id, lease_token, Arc::new(InMemoryLogBuffer::new()))
    }

    pub fn with_buffer(
        build_id: Uuid,
        lease_token: Uuid,
        logs: Arc<dyn LogBufferService>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            build_id,
            lease_token,
            logs,
            cancel,
            lease_lost: AtomicBool::new(false),
        })
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.add_entry(LogEntry::new(level, message));
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn drain_logs(&self) -> Vec<LogEntry> {
        self.logs.drain()
    }

    /// Asks the executor to stop; idempotent
    pub fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives in self, so this only errors if self is dropped
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Another worker may own the build now; stop without reporting
    pub fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
        self.request_cancel();
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.cancelled().await })
        };

        ctx.request_cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
        assert!(!ctx.lease_lost());
    }

    #[tokio::test]
    async fn test_cancelled_returns_at_once_when_already_set() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.mark_lease_lost();
        tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
            .await
            .unwrap();
        assert!(ctx.lease_lost());
    }

    #[test]
    fn test_logs_are_buffered() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.log_info("cloning repository");
        ctx.log_error("push denied");
        let entries = ctx.drain_logs();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert!(ctx.drain_logs().is_empty());
    }
}
