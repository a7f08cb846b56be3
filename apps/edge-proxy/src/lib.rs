pub mod bridge_client;
pub mod config;
pub mod proxy;
pub mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ProxyConfig;
use crate::routes::{build_router, AppState};

pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")
}

pub async fn run(config: ProxyConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    serve(listener, Arc::new(config)).await
}

/// Serves relay sessions until ctrl-c.
pub async fn serve(listener: TcpListener, config: Arc<ProxyConfig>) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(
        listen_addr = %local_addr,
        bridge_url = %config.bridge_url,
        mode = ?config.mode,
        drain_on_ping = config.drain_on_ping,
        "edge-proxy listening"
    );
    let router = build_router(AppState { config });
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received; shutting down");
        })
        .await
        .context("server shutdown with error")?;
    info!("edge-proxy stopped");
    Ok(())
}
