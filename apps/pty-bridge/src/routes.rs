use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_proto::{Geometry, Message, ProtocolError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bridge::Bridge;
use crate::stream;
use crate::terminal::TerminalError;

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Terminal(TerminalError::Unsupported(_)) => StatusCode::BAD_REQUEST,
            ApiError::Terminal(TerminalError::NotInitialized | TerminalError::NotRunning) => {
                StatusCode::CONFLICT
            }
            ApiError::Terminal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (status, Json(Message::error(self.to_string()))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/init", post(init))
        .route("/write", post(write))
        .route("/read", get(read))
        .route("/write-read", post(write_read))
        .route("/resize", post(resize))
        .route("/status", get(status))
        .route("/ws", get(stream::ws_handler))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn init(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    // An empty body means "default geometry, no workspace".
    let (geometry, repo) = if body.iter().all(u8::is_ascii_whitespace) {
        (Geometry::default(), None)
    } else {
        match relay_proto::decode(&body)? {
            Message::Init { cols, rows, repo } => (Geometry::new(cols, rows), repo),
            Message::Resize { cols, rows } => (Geometry::new(cols, rows), None),
            other => {
                return Err(ApiError::BadRequest(format!(
                    "expected init message, got `{}`",
                    other.kind()
                )))
            }
        }
    };
    info!(cols = geometry.cols, rows = geometry.rows, repo = ?repo, "init requested");
    let report = state.bridge.initialize(geometry, repo).await?;
    Ok(Json(report).into_response())
}

async fn write(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let message = relay_proto::decode(&body)?;
    state.bridge.write(&message)?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn read(State(state): State<AppState>) -> Result<Response, ApiError> {
    let messages = state.bridge.read()?;
    ndjson(&messages)
}

async fn write_read(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let message = relay_proto::decode(&body)?;
    let messages = state.bridge.write_read(&message)?;
    ndjson(&messages)
}

async fn resize(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let message = relay_proto::decode(&body)?;
    let geometry = message.geometry().ok_or_else(|| {
        ApiError::BadRequest(format!("expected resize message, got `{}`", message.kind()))
    })?;
    let (cols, rows) = state.bridge.resize(geometry)?;
    Ok(Json(json!({ "ok": true, "cols": cols, "rows": rows })).into_response())
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.status())
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn ndjson(messages: &[Message]) -> Result<Response, ApiError> {
    let mut body = Vec::new();
    for message in messages {
        body.extend(relay_proto::encode_line(message)?);
    }
    Ok(([(header::CONTENT_TYPE, NDJSON)], body).into_response())
}
