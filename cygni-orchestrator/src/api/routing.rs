//! Routing API Handler

use axum::{
    Json,
    extract::{Path, State},
};
use cygni_core::domain::routing::VariantWeight;

use crate::api::error::ApiResult;
use crate::service::ServiceError;
use crate::state::AppState;

/// GET /routing/{project_id}
/// Weights currently applied by the traffic router
pub async fn get_routing(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<VariantWeight>>> {
    let weights = state
        .router
        .current_weights(&project_id)
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(weights))
}
