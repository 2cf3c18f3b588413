//! Health Check API Handler

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /health
/// Liveness plus the number of canary control loops running in this process
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "canary_loops": state.canaries.active_loops(),
    }))
}
