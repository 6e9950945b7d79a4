//! HTTP API served to machines and status clients

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tiltr_common::protocol::{
    ClaimRequest, ClaimResponse, HeartbeatRequest, RegisterRequest, ReportRequest, StartRequest,
    StartResponse,
};
use tiltr_common::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::coordinator::Coordinator;

type AppState = Arc<Coordinator>;

/// Error response carrying the coordinator error
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidPlan(_) | Error::InvalidRequest(_) | Error::PlanParse(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::WorkerUnavailable(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the coordinator router
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/workers", post(register_handler).get(list_workers_handler))
        .route("/api/workers/:worker_id/heartbeat", post(heartbeat_handler))
        .route("/api/workers/:worker_id/claim", post(claim_handler))
        .route("/api/assignments/:assignment_id/start", post(start_handler))
        .route("/api/assignments/:assignment_id/outcome", post(outcome_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/runs/:run_id", get(run_report_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, coordinator: Arc<Coordinator>, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!("Coordinator API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": tiltr_common::VERSION,
    }))
}

async fn register_handler(
    State(coordinator): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let registration = coordinator.register_worker(&req.name, req.capacity)?;
    Ok((StatusCode::CREATED, Json(registration)).into_response())
}

async fn list_workers_handler(State(coordinator): State<AppState>) -> ApiResult<Response> {
    Ok(Json(coordinator.list_workers()?).into_response())
}

async fn heartbeat_handler(
    State(coordinator): State<AppState>,
    Path(worker_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Response> {
    let response = coordinator.heartbeat(&worker_id, &req.in_flight)?;
    Ok(Json(response).into_response())
}

async fn claim_handler(
    State(coordinator): State<AppState>,
    Path(worker_id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Response> {
    let assignments = coordinator.next_assignment(&worker_id, req.capacity)?;
    Ok(Json(ClaimResponse { assignments }).into_response())
}

async fn start_handler(
    State(coordinator): State<AppState>,
    Path(assignment_id): Path<String>,
    Json(req): Json<StartRequest>,
) -> ApiResult<Response> {
    let started = coordinator.mark_executing(&assignment_id, &req.worker_id)?;
    Ok(Json(StartResponse { started }).into_response())
}

async fn outcome_handler(
    State(coordinator): State<AppState>,
    Path(assignment_id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<Response> {
    let ack = coordinator.report_outcome(&assignment_id, &req.worker_id, &req.outcome)?;
    Ok(Json(ack).into_response())
}

async fn list_runs_handler(State(coordinator): State<AppState>) -> ApiResult<Response> {
    Ok(Json(coordinator.list_runs()?).into_response())
}

async fn run_report_handler(
    State(coordinator): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(coordinator.run_report(&run_id)?).into_response())
}
