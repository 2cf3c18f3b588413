//! Adapters to external systems
//!
//! The controller and services only talk to routing, metrics and
//! notification backends through these traits, so each backend can be
//! swapped without touching orchestration logic.

pub mod metrics;
pub mod notifier;
pub mod router;

use cygni_core::domain::routing::WeightError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{EmptyMetricsReader, MetricsReader, PrometheusMetricsReader};
pub use notifier::{LogNotifier, Notifications, Notifier, WebhookNotifier};
pub use router::{HttpTrafficRouter, InMemoryTrafficRouter, TrafficRouter};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected weights: {0}")]
    Weights(#[from] WeightError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Bounds an adapter call by `deadline`
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| AdapterError::Timeout(deadline))?
}

/// Turns a non-success HTTP response into [`AdapterError::Status`]
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AdapterError::Status {
        status: status.as_u16(),
        body,
    })
}
