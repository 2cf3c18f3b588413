//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod build;
pub mod canary;
pub mod deployment;
pub mod error;
pub mod health;
pub mod queue;
pub mod routing;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Build endpoints
        .route("/build", post(build::submit_build))
        .route(
            "/build/{id}",
            get(build::get_build).delete(build::delete_build),
        )
        .route(
            "/build/{id}/logs",
            get(build::get_build_logs).post(build::add_build_logs),
        )
        .route("/build/{id}/cancel", post(build::cancel_build))
        .route("/build/{id}/cancel/ack", post(build::ack_cancel))
        .route("/build/{id}/heartbeat", post(build::heartbeat))
        .route("/build/{id}/complete", post(build::complete_build))
        .route(
            "/build/project/{project_id}",
            get(build::list_builds_by_project),
        )
        // Queue endpoints
        .route("/queue/claim", post(queue::claim_build))
        // Deployment endpoints
        .route("/deployment/{id}", get(deployment::get_deployment))
        .route(
            "/deployment/project/{project_id}",
            get(deployment::list_deployments_by_project),
        )
        // Canary endpoints
        .route("/canary", post(canary::start_canary))
        .route("/canary/{id}", get(canary::get_canary))
        .route("/canary/{id}/promote", post(canary::promote_canary))
        .route("/canary/{id}/rollback", post(canary::rollback_canary))
        .route("/canary/{id}/pause", post(canary::pause_canary))
        .route("/canary/{id}/traffic", post(canary::update_traffic))
        .route(
            "/canary/deployment/{deployment_id}",
            get(canary::list_canaries_by_deployment),
        )
        // Routing endpoints
        .route("/routing/{project_id}", get(routing::get_routing))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
