//! HTTP API endpoints

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use ota_core::{
    CommandAck, DownloadCommand, ErrorCode, ErrorInfo, ErrorKind, InstallCommand, OtaError,
    OtaManager,
};

#[derive(Clone)]
pub struct ApiState {
    pub manager: OtaManager,
}

#[derive(Debug, Serialize)]
struct AckResponse {
    status: CommandAck,
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/download", post(start_download))
        .route("/v1/install", post(start_install))
        .route("/v1/progress", get(progress))
        .route("/v1/acknowledge", post(acknowledge))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// POST /v1/download - Start or resume a download
async fn start_download(
    State(state): State<ApiState>,
    body: Result<Json<DownloadCommand>, JsonRejection>,
) -> Response {
    let Json(cmd) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let version = cmd.version.clone();
    match state.manager.start_download(cmd) {
        Ok(ack) => {
            info!(%version, ?ack, "Download command accepted");
            ack_response(ack)
        }
        Err(e) => error_response(&e),
    }
}

/// POST /v1/install - Install the verified package
async fn start_install(
    State(state): State<ApiState>,
    body: Result<Json<InstallCommand>, JsonRejection>,
) -> Response {
    let Json(cmd) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let version = cmd.version.clone();
    match state.manager.start_install(cmd) {
        Ok(ack) => {
            info!(%version, ?ack, "Install command accepted");
            ack_response(ack)
        }
        Err(e) => error_response(&e),
    }
}

/// GET /v1/progress - Current operation state
async fn progress(State(state): State<ApiState>) -> Response {
    Json(state.manager.progress()).into_response()
}

/// POST /v1/acknowledge - Clear a fatal rollback failure
async fn acknowledge(State(state): State<ApiState>) -> Response {
    match state.manager.acknowledge_fatal() {
        Ok(()) => Json(state.manager.progress()).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /health - Health check
async fn health_handler() -> &'static str {
    "ok"
}

fn ack_response(ack: CommandAck) -> Response {
    let status = if ack.is_new() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(AckResponse { status: ack })).into_response()
}

fn bad_body(rejection: JsonRejection) -> Response {
    warn!("Rejected request body: {}", rejection.body_text());
    let info = ErrorInfo::new(ErrorCode::InvalidRequest, rejection.body_text());
    (StatusCode::BAD_REQUEST, Json(info)).into_response()
}

/// Map a command error to its HTTP status.
fn status_for(err: &OtaError) -> StatusCode {
    match err {
        OtaError::PackageExpired { .. } => StatusCode::GONE,
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_response(err: &OtaError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("Command failed: {}", err);
    } else {
        info!("Command rejected: {}", err);
    }
    (status, Json(ErrorInfo::from(err))).into_response()
}
