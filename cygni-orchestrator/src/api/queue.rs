//! Queue API Handlers
//!
//! Workers pull work here; the orchestrator never pushes builds.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use cygni_core::dto::build::ClaimBuild;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// POST /queue/claim
/// Lease the next available build, or 204 when the queue is empty
pub async fn claim_build(
    State(state): State<AppState>,
    Json(req): Json<ClaimBuild>,
) -> ApiResult<Response> {
    match state.builds.claim(&req.worker_id).await? {
        Some(claimed) => {
            tracing::info!(
                "Worker {} leased build {} until {}",
                req.worker_id,
                claimed.build_id,
                claimed.lease_expires_at
            );
            Ok(Json(claimed).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
