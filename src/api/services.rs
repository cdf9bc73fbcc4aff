use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};

use super::{
    error::ApiError,
    models::{CancelResponse, JobAcceptedResponse, JobListResponse, ListJobsQuery, SubmitJobRequest},
    state::AppState,
};
use crate::queue::{CancelOutcome, JobStatus};

const DEFAULT_LIST_LIMIT: usize = 100;
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Job submission endpoint (POST /jobs)
///
/// ## Flow:
/// 1. Validate Content-Type (application/json, optional charset)
/// 2. Read the body, enforcing the configured size limit
/// 3. Resolve the job name against the handler registry
/// 4. Enqueue without waiting; a full queue is a 503
/// 5. Return 202 Accepted with the job id
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    super::utils::require_json(&headers)?;

    let data = read_body(body, state.max_body_bytes()).await?;
    let request: SubmitJobRequest = serde_json::from_slice(&data)?;

    let queue = state.engine.queue();
    if !queue.handlers().contains(&request.name) {
        return Err(ApiError::UnsupportedJobType(request.name));
    }

    let job_id = queue.submit(&request.name, request.payload)?;
    tracing::info!(job_id = %job_id, job = %request.name, "Job accepted");

    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse { job_id })))
}

async fn read_body(body: axum::body::Body, max_size: usize) -> Result<bytes::Bytes, ApiError> {
    // one byte over the limit is enough to tell an oversized body apart
    let data = axum::body::to_bytes(body, max_size.saturating_add(1))
        .await
        .map_err(|_| ApiError::PayloadTooLarge(max_size.saturating_add(1)))?;

    super::utils::check_body_limit(&data, max_size)?;
    Ok(data)
}

/// Job record (GET /jobs/{job_id})
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = super::utils::parse_job_id(&job_id)?;
    let job = state.engine.queue().get_status(&id)?;
    Ok((StatusCode::OK, Json(job)))
}

/// Cancel a job (DELETE /jobs/{job_id})
///
/// 200 when a waiting job was cancelled, 202 when a running job was signalled
/// and 409 when the job had already finished.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = super::utils::parse_job_id(&job_id)?;
    let outcome = state.engine.queue().cancel(&id)?;

    let status = match outcome {
        CancelOutcome::Cancelled => StatusCode::OK,
        CancelOutcome::Signalled => StatusCode::ACCEPTED,
        CancelOutcome::AlreadyFinished(status) => {
            return Err(ApiError::Conflict(format!("job {id} already {status}")));
        }
    };

    Ok((status, Json(CancelResponse { job_id: id, outcome })))
}

/// Job listing (GET /jobs?status=failed&limit=20), oldest first
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    let jobs = state.engine.queue().list(status, limit);
    Ok(Json(JobListResponse { jobs }))
}

/// Per-status counts and queue occupancy (GET /jobs/stats)
pub async fn job_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.queue().stats())
}

/// Breaker snapshots (GET /breakers)
pub async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.breakers().snapshots())
}

/// Force a breaker closed (POST /breakers/{name}/reset)
pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let breakers = state.engine.breakers();
    breakers.reset(&name)?;
    tracing::info!(dependency = %name, "Breaker reset by operator");

    let snapshot = breakers
        .find(&name)
        .map(|breaker| breaker.snapshot())
        .ok_or_else(|| ApiError::NotFound(format!("breaker '{name}'")))?;
    Ok(Json(snapshot))
}

/// Cache statistics (GET /cache/stats)
pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.cache().stats())
}

/// Scheduled task info (GET /scheduler/tasks)
pub async fn scheduler_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.scheduler().infos())
}

/// Prometheus exposition (GET /metrics)
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.engine.render_metrics(),
    )
}

/// Health check endpoint (GET /health)
///
/// 200 while the engine accepts work (status "ok", or "degraded" when a
/// breaker is open); 503 once shutdown has begun.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.health();
    let status_code = if report.accepting_jobs {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(report))
}
