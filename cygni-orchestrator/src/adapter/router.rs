//! Traffic Router adapter
//!
//! Sole writer of external routing state for a project. Every weight set is
//! checked with [`validate_weights`] before it leaves the process.

use async_trait::async_trait;
use cygni_core::domain::routing::{VariantWeight, validate_weights};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{AdapterError, check_status};

#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Replaces the weight set of a project. Weights must sum to 100.
    async fn set_weights(&self, project_id: &str, weights: &[VariantWeight]) -> Result<(), AdapterError>;

    /// Current weight set of a project, empty if none was ever set
    async fn current_weights(&self, project_id: &str) -> Result<Vec<VariantWeight>, AdapterError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteTable {
    weights: Vec<VariantWeight>,
}

/// Router backed by an HTTP routing service exposing `/routes/{project_id}`
pub struct HttpTrafficRouter {
    base_url: String,
    client: Client,
}

impl HttpTrafficRouter {
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn route_url(&self, project_id: &str) -> String {
        format!("{}/routes/{}", self.base_url, project_id)
    }
}

#[async_trait]
impl TrafficRouter for HttpTrafficRouter {
    async fn set_weights(&self, project_id: &str, weights: &[VariantWeight]) -> Result<(), AdapterError> {
        validate_weights(weights)?;

        let response = self
            .client
            .put(self.route_url(project_id))
            .json(&RouteTable {
                weights: weights.to_vec(),
            })
            .send()
            .await?;
        check_status(response).await?;

        tracing::debug!("Routing for project {} set to {:?}", project_id, weights);
        Ok(())
    }

    async fn current_weights(&self, project_id: &str) -> Result<Vec<VariantWeight>, AdapterError> {
        let response = self.client.get(self.route_url(project_id)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let table: RouteTable = check_status(response).await?.json().await?;
        Ok(table.weights)
    }
}

/// Router that keeps routing tables in process
///
/// Used when no external router is configured, and by tests.
#[derive(Default)]
pub struct InMemoryTrafficRouter {
    tables: Mutex<HashMap<String, Vec<VariantWeight>>>,
}

impl InMemoryTrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrafficRouter for InMemoryTrafficRouter {
    async fn set_weights(&self, project_id: &str, weights: &[VariantWeight]) -> Result<(), AdapterError> {
        validate_weights(weights)?;
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), weights.to_vec());
        Ok(())
    }

    async fn current_weights(&self, project_id: &str) -> Result<Vec<VariantWeight>, AdapterError> {
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}
