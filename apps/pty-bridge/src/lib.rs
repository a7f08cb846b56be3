pub mod bridge;
pub mod config;
pub mod routes;
pub mod stream;
pub mod telemetry;
pub mod terminal;
pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::routes::{build_router, AppState};

/// Serves the bridge until ctrl-c, or until the terminal has exited and the
/// configured linger has elapsed. The terminal is killed on the way out.
pub async fn run(config: BridgeConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let bridge = Arc::new(Bridge::new(config));
    serve(listener, bridge, metrics).await
}

pub async fn serve(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let router = build_router(AppState {
        bridge: bridge.clone(),
        metrics,
    });
    info!(listen_addr = %local_addr, "pty-bridge listening");

    let shutdown = shutdown_signal(bridge.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    bridge.shutdown();
    info!("pty-bridge stopped");
    Ok(())
}

async fn shutdown_signal(bridge: Arc<Bridge>) {
    let linger = bridge.config().exit_linger;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            // Killing the terminal broadcasts `exit`, which closes open streams.
            bridge.shutdown();
        }
        code = bridge.wait_for_exit() => {
            info!(code, linger_secs = linger.as_secs(), "terminal exited; shutting down after linger");
            tokio::time::sleep(linger).await;
        }
    }
}
