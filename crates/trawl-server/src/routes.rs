use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use futures::{SinkExt, StreamExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use trawl_core::job::Platform;
use trawl_core::{AppError, Subscription};

use crate::auth::require_api_key;
use crate::dto::{
    CancelJobResponse, CreateJobRequest, CreateJobResponse, HealthResponse,
    InvalidateCacheResponse, JobListResponse, JobResponse, StatsQuery, StatusResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}", delete(cancel_job))
        .route("/v1/cache/{platform}", delete(invalidate_cache))
        .route("/v1/status", get(status))
        .route("/ws", get(ws_all))
        .route("/ws/jobs/{id}", get(ws_job))
        .route("/ws/stats", get(ws_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job started", body = CreateJobResponse),
        (status = 400, description = "Invalid platform, target or limit", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.into_start_request()?;
    let job_id = state.orchestrator.start_job(request)?;

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(CreateJobResponse {
            job_id,
            status: "running".to_string(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    responses(
        (status = 200, description = "Active jobs", body = JobListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .orchestrator
        .active_jobs()
        .into_iter()
        .map(JobResponse::from)
        .collect();
    let total = jobs.len();
    axum::Json(JobListResponse { jobs, total })
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Job not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .get_job_status(id)
        .await
        .ok_or(AppError::JobNotFound(id))?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Cancellation result; false when the job already finished", body = CancelJobResponse),
        (status = 404, description = "Job not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.orchestrator.cancel_job(id);
    if !cancelled && state.orchestrator.get_job_status(id).await.is_none() {
        return Err(AppError::JobNotFound(id).into());
    }
    Ok(axum::Json(CancelJobResponse {
        job_id: id,
        cancelled,
    }))
}

// ---------------------------------------------------------------------------
// Cache & status
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/v1/cache/{platform}",
    params(("platform" = String, Path, description = "Platform whose cached results are dropped")),
    responses(
        (status = 200, description = "Entries removed", body = InvalidateCacheResponse),
        (status = 400, description = "Unknown platform", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "cache"
)]
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let platform: Platform = platform.parse().map_err(AppError::InvalidRequest)?;
    let removed = state.orchestrator.invalidate_platform(platform).await?;
    Ok(axum::Json(InvalidateCacheResponse {
        platform: platform.to_string(),
        removed,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/status",
    responses(
        (status = 200, description = "Connections, subscriptions and per-platform stats", body = StatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(StatusResponse::new(
        state.orchestrator.status(),
        &state.orchestrator.supported_platforms(),
    ))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_jobs: state.orchestrator.active_job_count(),
    })
}

// ---------------------------------------------------------------------------
// WebSocket streams
// ---------------------------------------------------------------------------

/// Every event of every job.
pub async fn ws_all(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let subscription = state.orchestrator.broadcaster().subscribe(None);
    ws.on_upgrade(move |socket| forward_events(socket, state, subscription, false))
}

/// Events of one job; the socket is closed after its terminal event.
pub async fn ws_job(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    if state.orchestrator.get_job_status(id).await.is_none() {
        return Err(AppError::JobNotFound(id).into());
    }
    let subscription = state.orchestrator.broadcaster().subscribe(Some(id));
    Ok(ws.on_upgrade(move |socket| forward_events(socket, state, subscription, true)))
}

/// Periodic stats snapshots.
pub async fn ws_stats(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let interval = Duration::from_secs(query.interval.unwrap_or(DEFAULT_STATS_INTERVAL_SECS));
    let subscription = state.orchestrator.broadcaster().subscribe_stats(interval)?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, state, subscription, false)))
}

/// Pump events from a subscription into a socket until either side goes away.
async fn forward_events(
    socket: WebSocket,
    state: Arc<AppState>,
    mut subscription: Subscription,
    close_on_terminal: bool,
) {
    let connection_id = subscription.id;
    let (mut sink, mut incoming) = socket.split();
    tracing::debug!(connection_id, "WebSocket connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(connection_id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if close_on_terminal && terminal {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "job finished".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.orchestrator.broadcaster().unsubscribe(connection_id);
    tracing::debug!(connection_id, "WebSocket disconnected");
}
