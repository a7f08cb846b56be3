use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::session::RelayConfig;

#[derive(Debug, Parser)]
#[command(
    name = "ssh-relay",
    author,
    version,
    about = "SSH front edge relaying terminal sessions to sandbox instances"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address the SSH server listens on.
    #[arg(long, env = "SSH_LISTEN_ADDR", default_value = "0.0.0.0:2222")]
    pub listen: String,

    /// Host private key; an ed25519 key is generated here when missing.
    #[arg(long, env = "SSH_HOST_KEY_PATH", default_value = "/etc/ssh-relay/host_key")]
    pub host_key: PathBuf,

    /// SQLite database of authorized key fingerprints.
    #[arg(long, env = "SSH_KEY_DB_PATH", default_value = "/var/lib/ssh-relay/keys.db")]
    pub key_db: PathBuf,

    /// WebSocket URL of the backend sessions are relayed to.
    #[arg(long, env = "WORKER_URL")]
    pub worker_url: Option<String>,

    /// Shared secret sent to the backend as `X-Auth-Secret`.
    #[arg(long, env = "AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Register unknown keys on first use.
    #[arg(
        long,
        env = "AUTO_REGISTER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_register: bool,

    /// Interval between liveness pings to the backend; 0 disables them.
    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 100)]
    pub ping_interval_ms: u64,

    /// Timeout for opening the backend WebSocket.
    #[arg(long, env = "DIAL_TIMEOUT_SECS", default_value_t = 30)]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or edit the authorized key registry.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum KeysAction {
    /// List registered fingerprints.
    List,
    /// Remove a fingerprint (`SHA256:...`).
    Remove { fingerprint: String },
    /// Print the number of registered keys.
    Count,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub host_key: PathBuf,
    pub key_db: PathBuf,
    pub auto_register: bool,
    pub relay: RelayConfig,
}

impl TryFrom<&Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen))?;
        let worker_url = cli
            .worker_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .context("worker URL is required: --worker-url or WORKER_URL")?;
        if !(worker_url.starts_with("ws://") || worker_url.starts_with("wss://")) {
            anyhow::bail!("worker URL must be ws:// or wss://, got {worker_url}");
        }

        Ok(ServerConfig {
            listen_addr,
            host_key: cli.host_key.clone(),
            key_db: cli.key_db.clone(),
            auto_register: cli.auto_register,
            relay: RelayConfig {
                worker_url,
                auth_secret: cli.auth_secret.clone().filter(|secret| !secret.is_empty()),
                ping_interval: Duration::from_millis(cli.ping_interval_ms),
                dial_timeout: Duration::from_secs(cli.dial_timeout_secs),
            },
        })
    }
}
