use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use launchpad_session::{
    LaunchResponse, ListRunningResponse, LogsResponse, PrepareResponse, StatusResponse,
    StopAllResponse, StopPortResponse, StopResponse,
};
use serde::{Deserialize, Serialize};

use crate::{error::DemoError, error_payload::ErrorPayload, orchestrator::Orchestrator};

pub const USER_HEADER: &str = "x-user-id";
const DEFAULT_LOG_LIMIT: usize = 200;

pub struct ApiError(DemoError);

impl From<DemoError> for ApiError {
    fn from(err: DemoError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &DemoError) -> StatusCode {
    match err {
        DemoError::NotFound(_) => StatusCode::NOT_FOUND,
        DemoError::InvalidProjectId(_) => StatusCode::BAD_REQUEST,
        DemoError::Forbidden(_) => StatusCode::FORBIDDEN,
        DemoError::NotReady | DemoError::Conflict { .. } => StatusCode::CONFLICT,
        DemoError::PreparationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DemoError::PortExhausted { .. } | DemoError::BindFailed { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DemoError::ProcessCrashed(_) => StatusCode::BAD_GATEWAY,
        DemoError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DemoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(ErrorPayload::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn prepare(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
) -> ApiResult<PrepareResponse> {
    Ok(Json(orch.ensure_prepared(&project_id).await?))
}

async fn launch(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
) -> ApiResult<LaunchResponse> {
    Ok(Json(orch.launch(&project_id).await?))
}

async fn status(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
) -> ApiResult<StatusResponse> {
    Ok(Json(orch.status(&project_id)?))
}

async fn stop(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StopResponse> {
    orch.authorize(&project_id, caller(&headers))?;
    Ok(Json(orch.stop(&project_id).await?))
}

async fn cleanup(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StopResponse> {
    orch.authorize(&project_id, caller(&headers))?;
    Ok(Json(orch.cleanup(&project_id).await?))
}

async fn stop_all(State(orch): State<Orchestrator>) -> Json<StopAllResponse> {
    Json(orch.stop_all().await)
}

async fn running(State(orch): State<Orchestrator>) -> Json<ListRunningResponse> {
    Json(orch.list_running())
}

async fn stop_port(
    State(orch): State<Orchestrator>,
    Path(port): Path<u16>,
) -> ApiResult<StopPortResponse> {
    Ok(Json(orch.release_port(port).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn logs(
    State(orch): State<Orchestrator>,
    Path(project_id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<LogsResponse> {
    let cursor = q
        .cursor
        .as_deref()
        .and_then(|c| c.parse::<u64>().ok())
        .unwrap_or(0);
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(orch.logs(&project_id, cursor, limit).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthzResponse {
    pub status: String,
    pub version: String,
    pub port_range: [u16; 2],
    pub ports_in_use: usize,
}

async fn healthz(State(orch): State<Orchestrator>) -> Json<HealthzResponse> {
    let (min, max) = orch.ports().range();
    Json(HealthzResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        port_range: [min, max],
        ports_in_use: orch.ports().list_used().len(),
    })
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let demo = Router::new()
        .route("/stop-all", post(stop_all))
        .route("/running", get(running))
        .route("/ports/:port/stop", post(stop_port))
        .route("/:project_id/prepare", post(prepare))
        .route("/:project_id/launch", post(launch))
        .route("/:project_id/status", get(status))
        .route("/:project_id/stop", post(stop))
        .route("/:project_id/cleanup", post(cleanup))
        .route("/:project_id/logs", get(logs));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/demo", demo)
        .with_state(orchestrator)
}
