//! Build API Handlers
//!
//! HTTP endpoints for build submission, status, logs and the worker side of
//! the build lifecycle (heartbeat, completion, cancel acknowledgement).

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use cygni_core::domain::build::Build;
use cygni_core::domain::log::LogEntry;
use cygni_core::dto::build::{
    BuildSummary, BuildView, CancelAck, CompleteBuild, Heartbeat, HeartbeatAck, SubmitBuild,
};
use cygni_core::dto::log::LogBatch;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::service::log::LiveFollow;
use crate::state::AppState;

// =============================================================================
// Build Lifecycle Endpoints
// =============================================================================

/// POST /build
/// Submit a build; it starts out pending in the queue
pub async fn submit_build(
    State(state): State<AppState>,
    Json(req): Json<SubmitBuild>,
) -> ApiResult<(StatusCode, Json<Build>)> {
    tracing::info!(
        "Submitting build for {}@{}",
        req.project_id,
        req.commit_sha
    );

    let build = state.builds.submit(req).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

/// GET /build/{id}
/// Current status with accumulated logs
pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BuildView>> {
    tracing::debug!("Getting build: {}", id);
    Ok(Json(state.builds.view(id).await?))
}

/// GET /build/project/{project_id}
/// Builds of a project, newest first
pub async fn list_builds_by_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<BuildSummary>>> {
    tracing::debug!("Listing builds for project: {}", project_id);

    let builds = state.builds.list_by_project(&project_id).await?;
    Ok(Json(builds.into_iter().map(BuildSummary::from).collect()))
}

/// POST /build/{id}/cancel
/// Cancel a pending or running build; a finished build is returned as is
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Build>> {
    tracing::info!("Cancelling build: {}", id);
    Ok(Json(state.builds.cancel(id).await?))
}

/// DELETE /build/{id}
pub async fn delete_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting build: {}", id);
    state.builds.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Worker Endpoints
// =============================================================================

/// POST /build/{id}/heartbeat
/// Renew the caller's lease; the answer carries the cancel flag
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<Heartbeat>,
) -> ApiResult<Json<HeartbeatAck>> {
    tracing::trace!("Heartbeat from {} for build {}", req.worker_id, id);
    Ok(Json(state.builds.heartbeat(id, req).await?))
}

/// POST /build/{id}/complete
/// Report the outcome of the current attempt
pub async fn complete_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteBuild>,
) -> ApiResult<Json<Build>> {
    tracing::info!("Worker {} completing build {}", req.worker_id, id);
    Ok(Json(state.builds.complete(id, req).await?))
}

/// POST /build/{id}/cancel/ack
/// Worker confirmation that a cancelled build was stopped
pub async fn ack_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelAck>,
) -> ApiResult<Json<Build>> {
    tracing::info!("Worker {} acknowledged cancel of build {}", req.worker_id, id);
    Ok(Json(state.builds.ack_cancel(id, req).await?))
}

// =============================================================================
// Log Endpoints
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub live: bool,
}

/// GET /build/{id}/logs
/// Stored entries, or with `?live=true` an event stream that replays them
/// and then follows new output until the build finishes
pub async fn get_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    // 404 for unknown builds in both modes
    state.builds.get(id).await?;

    if !query.live {
        tracing::debug!("Getting logs for build: {}", id);
        let entries = state.logs.entries(id).await?;
        return Ok(Json(entries).into_response());
    }

    tracing::debug!("Following logs for build: {}", id);
    let follow = state.logs.follow(id).await?;
    Ok(live_stream(id, follow).into_response())
}

fn live_stream(
    build_id: Uuid,
    follow: LiveFollow,
) -> Sse<impl futures_util::Stream<Item = Result<Event, axum::Error>>> {
    let updates = match follow.updates {
        Some(rx) => BroadcastStream::new(rx)
            .filter_map(move |item| async move {
                match item {
                    Ok(entry) => Some(entry),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Live log follower of build {} lagged, {} entries skipped",
                            build_id,
                            skipped
                        );
                        None
                    }
                }
            })
            .boxed(),
        None => stream::empty::<LogEntry>().boxed(),
    };

    let events = stream::iter(follow.snapshot)
        .chain(updates)
        .map(|entry| Event::default().event("log").json_data(&entry));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// POST /build/{id}/logs
/// Append a batch from the worker holding the lease
pub async fn add_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(batch): Json<LogBatch>,
) -> ApiResult<StatusCode> {
    tracing::debug!(
        "Adding {} log entries for build: {}",
        batch.entries.len(),
        id
    );

    state.logs.append(id, batch).await?;
    Ok(StatusCode::CREATED)
}
