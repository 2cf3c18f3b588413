//! Notifier adapter
//!
//! Lifecycle events go out after the state change they describe is
//! persisted. Delivery is best effort: failures are logged and retried in
//! the background and never reach the caller.

use async_trait::async_trait;
use cygni_core::domain::event::LifecycleEvent;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::{AdapterError, check_status};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), AdapterError>;
}

/// Writes events to the tracing log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), AdapterError> {
        tracing::info!(
            kind = ?event.kind,
            subject = %event.subject_id,
            project = %event.project_id,
            "{}",
            event.summary
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), AdapterError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Fire-and-forget dispatcher with bounded retries
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Delivers the event on a background task
    pub fn emit(&self, event: LifecycleEvent) {
        let notifier = self.notifier.clone();
        let max_attempts = self.max_attempts;
        let retry_delay = self.retry_delay;

        tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                match notifier.notify(&event).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to deliver {:?} event for {} (attempt {}/{}): {}",
                            event.kind,
                            event.subject_id,
                            attempt,
                            max_attempts,
                            e
                        );
                        if attempt < max_attempts {
                            tokio::time::sleep(retry_delay * 2u32.pow(attempt - 1)).await;
                        }
                    }
                }
            }
            tracing::error!(
                "Dropping {:?} event for {} after {} attempts",
                event.kind,
                event.subject_id,
                max_attempts
            );
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use cygni_core::domain::event::EventKind;
    use std::sync::Mutex;

    /// Records every delivered event
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl RecordingNotifier {
        pub fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }

        pub fn find(&self, kind: EventKind) -> Option<LifecycleEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.kind == kind)
                .cloned()
        }

        /// Waits for the background delivery of an event of `kind`
        pub async fn wait_for(&self, kind: EventKind) -> LifecycleEvent {
            for _ in 0..200 {
                if let Some(event) = self.find(kind) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no {:?} event delivered; saw {:?}", kind, self.kinds());
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &LifecycleEvent) -> Result<(), AdapterError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use cygni_core::domain::event::EventKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FlakyNotifier {
        calls: AtomicU32,
        inner: RecordingNotifier,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, event: &LifecycleEvent) -> Result<(), AdapterError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AdapterError::Malformed("webhook down".to_string()));
            }
            self.inner.notify(event).await
        }
    }

    #[tokio::test]
    async fn test_emit_retries_failed_delivery() {
        let notifier = Arc::new(FlakyNotifier {
            calls: AtomicU32::new(0),
            inner: RecordingNotifier::default(),
        });
        let notifications =
            Notifications::new(notifier.clone()).with_retry(3, Duration::from_millis(1));

        notifications.emit(LifecycleEvent::new(
            EventKind::BuildCreated,
            Uuid::new_v4(),
            "shop",
            "build created",
        ));

        notifier.inner.wait_for(EventKind::BuildCreated).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }
}
