//! Canary API Handlers
//!
//! Starting releases, reading their status and the operator controls.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use cygni_core::domain::canary::CanaryRelease;
use cygni_core::dto::canary::{CanaryView, RollbackCanary, StartCanary, UpdateTraffic};
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// POST /canary
pub async fn start_canary(
    State(state): State<AppState>,
    Json(req): Json<StartCanary>,
) -> ApiResult<(StatusCode, Json<CanaryRelease>)> {
    tracing::info!("Starting canary for deployment: {}", req.deployment_id);

    let release = state.canaries.start(req).await?;
    Ok((StatusCode::CREATED, Json(release)))
}

/// GET /canary/{id}
pub async fn get_canary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CanaryView>> {
    tracing::debug!("Getting canary: {}", id);
    Ok(Json(state.canaries.status(id).await?))
}

/// GET /canary/deployment/{deployment_id}
pub async fn list_canaries_by_deployment(
    State(state): State<AppState>,
    Path(deployment_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CanaryRelease>>> {
    tracing::debug!("Listing canaries for deployment: {}", deployment_id);
    Ok(Json(state.canaries.list_for_deployment(deployment_id).await?))
}

/// POST /canary/{id}/promote
pub async fn promote_canary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CanaryRelease>> {
    tracing::info!("Operator promoting canary: {}", id);
    Ok(Json(state.canaries.promote(id).await?))
}

/// POST /canary/{id}/rollback
pub async fn rollback_canary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RollbackCanary>,
) -> ApiResult<Json<CanaryRelease>> {
    tracing::info!("Operator rolling back canary: {}", id);
    Ok(Json(state.canaries.rollback(id, req.reason).await?))
}

/// POST /canary/{id}/pause
pub async fn pause_canary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CanaryRelease>> {
    tracing::info!("Operator pausing canary: {}", id);
    Ok(Json(state.canaries.pause(id).await?))
}

/// POST /canary/{id}/traffic
pub async fn update_traffic(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTraffic>,
) -> ApiResult<Json<CanaryRelease>> {
    tracing::info!(
        "Operator setting canary {} traffic to {}/{}",
        id,
        req.canary_percentage,
        req.stable_percentage
    );
    Ok(Json(state.canaries.update_traffic(id, req).await?))
}
