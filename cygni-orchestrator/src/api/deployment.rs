//! Deployment API Handlers
//!
//! Read-only; deployments are created from successful builds.

use axum::{
    Json,
    extract::{Path, State},
};
use cygni_core::domain::deployment::Deployment;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// GET /deployment/{id}
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    tracing::debug!("Getting deployment: {}", id);
    Ok(Json(state.deployments.get(id).await?))
}

/// GET /deployment/project/{project_id}
pub async fn list_deployments_by_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<Deployment>>> {
    tracing::debug!("Listing deployments for project: {}", project_id);
    Ok(Json(state.deployments.list_by_project(&project_id).await?))
}
