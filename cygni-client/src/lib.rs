//! Cygni HTTP Client
//!
//! A type-safe HTTP client for the Cygni orchestrator API.
//!
//! The worker uses it for the queue protocol (claim, heartbeat, logs,
//! completion); dashboards and other callers use it to submit builds and
//! drive canary releases.
//!
//! # Example
//!
//! ```no_run
//! use cygni_client::OrchestratorClient;
//! use cygni_core::dto::build::SubmitBuild;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let build = client.submit_build(SubmitBuild {
//!         project_id: "web".to_string(),
//!         repository: "https://git.example.com/web.git".to_string(),
//!         commit_sha: "abc123".to_string(),
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("Queued build: {}", build.id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod builds;
mod canaries;
mod deployments;
mod queue;

// Re-export commonly used types
pub use cygni_core::dto::build::ClaimedBuild;
pub use error::{ClientError, Result};

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

/// HTTP client for the Cygni orchestrator API
///
/// Methods are grouped by resource:
/// - Builds (submit, status, logs, cancel, delete)
/// - Queue protocol for workers (claim, heartbeat, complete, cancel ack)
/// - Deployments (read-only)
/// - Canary releases (start, status, promote, rollback, pause, traffic)
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client around a configured reqwest Client (timeouts, TLS)
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET /health
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Like [`Self::handle_response`], but 204 No Content yields `None`
    async fn handle_optional_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ClientError::api_error(status.as_u16(), error_text))
    }
}
