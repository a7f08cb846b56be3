pub mod auth;
pub mod config;
pub mod host_key;
pub mod registry;
pub mod repo;
pub mod server;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Server as _;
use russh::SshId;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::Authorizer;
use crate::config::{KeysAction, ServerConfig};
use crate::registry::KeyRegistry;
use crate::server::RelayServer;

pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        // stderr keeps `keys` output on stdout clean.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")
}

/// Server settings shared by the binary and in-process tests.
pub fn ssh_config(host_key: russh_keys::key::KeyPair) -> Arc<russh::server::Config> {
    Arc::new(russh::server::Config {
        server_id: SshId::Standard(format!("SSH-2.0-ssh-relay_{}", env!("CARGO_PKG_VERSION"))),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        ..Default::default()
    })
}

/// Runs the SSH server until ctrl-c.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let registry = KeyRegistry::open(&config.key_db)
        .await
        .context("failed to open key registry")?;
    let count = registry.count().await.unwrap_or_default();
    info!(keys = count, path = %config.key_db.display(), "key registry ready");

    let host_key = host_key::load_or_generate(&config.host_key)?;
    let ssh_config = ssh_config(host_key);

    info!(
        listen_addr = %config.listen_addr,
        worker_url = %config.relay.worker_url,
        auto_register = config.auto_register,
        "ssh-relay listening"
    );
    let mut server = RelayServer::new(
        Authorizer::new(registry.clone(), config.auto_register),
        config.relay,
    );

    tokio::select! {
        result = server.run_on_address(ssh_config, config.listen_addr) => {
            result.context("ssh server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
        }
    }
    registry.close().await;
    info!("ssh-relay stopped");
    Ok(())
}

/// `keys list|remove|count` against the registry database.
pub async fn run_keys_command(key_db: &std::path::Path, action: KeysAction) -> Result<()> {
    let registry = KeyRegistry::open(key_db)
        .await
        .context("failed to open key registry")?;
    match action {
        KeysAction::List => {
            for key in registry.list().await? {
                let last_used = key
                    .last_used
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\tregistered {}\tlast used {}",
                    key.fingerprint,
                    format_timestamp(key.created_at),
                    last_used
                );
            }
        }
        KeysAction::Remove { fingerprint } => {
            if registry.remove(&fingerprint).await? {
                println!("removed {fingerprint}");
            } else {
                anyhow::bail!("no key registered with fingerprint {fingerprint}");
            }
        }
        KeysAction::Count => println!("{}", registry.count().await?),
    }
    registry.close().await;
    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}
