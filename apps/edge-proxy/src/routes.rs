use std::sync::Arc;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relay_proto::headers;
use tracing::warn;

use crate::config::ProxyConfig;
use crate::proxy::{self, SessionMeta};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// The secret is checked before the upgrade so a rejected relay sees 401
/// rather than an upgrade error.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> Response {
    if let Some(expected) = state.config.auth_secret.as_deref() {
        let presented = request_headers
            .get(headers::AUTH_SECRET)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected) {
            warn!("rejecting relay session with missing or wrong secret");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let meta = SessionMeta::from_headers(&request_headers);
    let config = state.config.clone();
    ws.on_upgrade(move |socket| proxy::run(socket, meta, config))
}
