//! API route handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use super::auth::RequireApiKey;
use super::error::ApiResult;
use super::state::AppState;
use super::types::*;
use crate::job::JobRequest;

// ============================================================================
// Health
// ============================================================================

/// Liveness endpoint; also reports whether Redis answers.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = match state.dispatcher.health().await {
        Ok(()) => "healthy",
        Err(_) => "degraded",
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: crate::version().to_string(),
        uptime_secs: state.uptime_secs(),
        drivers: state.dispatcher.driver_names(),
    })
}

// ============================================================================
// Device operations
// ============================================================================

/// Asynchronous single-device operation.
pub async fn exec_device(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobRequest>,
) -> ApiResult<impl IntoResponse> {
    let ticket = state.dispatcher.submit(request).await?;
    Ok(Json(ticket))
}

/// Bulk submission; one scheduling pass, per-host outcome partitions.
pub async fn bulk_device(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<JobRequest>>,
) -> ApiResult<impl IntoResponse> {
    info!(count = %requests.len(), "Bulk submission");
    let outcome = state.dispatcher.submit_bulk(requests).await?;
    Ok(Json(outcome))
}

/// Synchronous connection test.
pub async fn test_device(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<TestRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .dispatcher
        .test_connection(
            &request.driver,
            &request.connection_args,
            request.driver_args.as_ref(),
        )
        .await;
    Ok(Json(report))
}

// ============================================================================
// Jobs
// ============================================================================

/// Job record lookup.
pub async fn get_job(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> ApiResult<impl IntoResponse> {
    let job = state.dispatcher.get_job(&query.id).await?;
    Ok(Json(JobView::from(job)))
}

/// All retained jobs, newest first.
pub async fn list_jobs(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<impl IntoResponse> {
    let jobs = state.dispatcher.list_jobs(query.status).await?;
    let views: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Ok(Json(views))
}

/// Cancellation: queued jobs are removed, started jobs get the flag.
pub async fn cancel_job(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.dispatcher.cancel(&query.id).await?;
    Ok(Json(CancelResponse {
        id: query.id,
        outcome,
    }))
}

// ============================================================================
// Workers
// ============================================================================

/// Node and pinned-worker inventory.
pub async fn get_workers(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let inventory = state.dispatcher.worker_inventory().await?;
    Ok(Json(inventory))
}

/// Forcible termination of one host's pinned worker.
pub async fn terminate_worker(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkerQuery>,
) -> ApiResult<impl IntoResponse> {
    let terminated = state.dispatcher.terminate_worker(&query.name).await?;
    Ok(Json(TerminateResponse {
        name: query.name,
        terminated,
    }))
}
