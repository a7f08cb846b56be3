use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Attach to the bridge's push stream.
    Stream,
    /// Drive the bridge's buffered HTTP endpoints.
    Poll,
}

#[derive(Debug, Parser)]
#[command(
    name = "edge-proxy",
    author,
    version,
    about = "Forwards relay WebSocket sessions to a local pty-bridge"
)]
pub struct Cli {
    /// Address to accept relay WebSockets on.
    #[arg(long, env = "EDGE_PROXY_LISTEN", default_value = "0.0.0.0:8081")]
    pub listen: String,

    /// Base HTTP URL of the pty-bridge.
    #[arg(long, env = "BRIDGE_URL", default_value = "http://127.0.0.1:8080")]
    pub bridge_url: String,

    #[arg(long, env = "EDGE_PROXY_MODE", value_enum, default_value_t = Mode::Stream)]
    pub mode: Mode,

    /// In poll mode, drain the bridge's output on every relay ping.
    #[arg(
        long,
        env = "EDGE_PROXY_DRAIN_ON_PING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub drain_on_ping: bool,

    /// In poll mode, background read interval; 0 relies on pings alone.
    #[arg(long, env = "EDGE_PROXY_POLL_INTERVAL_MS", default_value_t = 50)]
    pub poll_interval_ms: u64,

    /// Required `X-Auth-Secret` value on incoming sessions.
    #[arg(long, env = "AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Timeout for bridge requests and the bridge WebSocket dial.
    #[arg(long, env = "EDGE_PROXY_BRIDGE_TIMEOUT_SECS", default_value_t = 30)]
    pub bridge_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub bridge_url: String,
    pub mode: Mode,
    pub drain_on_ping: bool,
    pub poll_interval: Duration,
    pub auth_secret: Option<String>,
    pub bridge_timeout: Duration,
}

impl TryFrom<Cli> for ProxyConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen))?;
        let config = ProxyConfig {
            listen_addr,
            bridge_url: cli.bridge_url.trim_end_matches('/').to_string(),
            mode: cli.mode,
            drain_on_ping: cli.drain_on_ping,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            auth_secret: cli.auth_secret.filter(|secret| !secret.is_empty()),
            bridge_timeout: Duration::from_secs(cli.bridge_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bridge_url.starts_with("http://") || self.bridge_url.starts_with("https://")) {
            anyhow::bail!("bridge URL must be http:// or https://, got {}", self.bridge_url);
        }
        if self.mode == Mode::Poll && !self.drain_on_ping && self.poll_interval.is_zero() {
            anyhow::bail!("poll mode needs --drain-on-ping or a non-zero --poll-interval-ms");
        }
        Ok(())
    }

    /// `http://host:port` → `ws://host:port/ws`.
    pub fn bridge_ws_url(&self) -> String {
        let base = if let Some(rest) = self.bridge_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.bridge_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.bridge_url.clone()
        };
        format!("{base}/ws")
    }

    pub fn for_bridge(bridge_url: impl Into<String>, mode: Mode) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bridge_url: bridge_url.into().trim_end_matches('/').to_string(),
            mode,
            drain_on_ping: true,
            poll_interval: Duration::from_millis(50),
            auth_secret: None,
            bridge_timeout: Duration::from_secs(10),
        }
    }
}
