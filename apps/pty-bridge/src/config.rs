use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "pty-bridge",
    author,
    version,
    about = "Owns the sandbox terminal process and serves its I/O over HTTP and WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PTY_BRIDGE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Directory repositories are cloned into; also the fallback working directory.
    #[arg(long, env = "PTY_BRIDGE_WORKSPACE_ROOT", default_value = "/root/dev")]
    pub workspace_root: PathBuf,

    /// Program to run inside the PTY (defaults to $SHELL).
    #[arg(long, env = "PTY_BRIDGE_COMMAND")]
    pub command: Option<String>,

    /// Maximum bytes of unread output retained for polling readers.
    #[arg(long, env = "PTY_BRIDGE_BUFFER_BYTES", default_value_t = 1024 * 1024)]
    pub buffer_bytes: usize,

    /// Upper bound on a single frame write to a push-stream client.
    #[arg(long, env = "PTY_BRIDGE_BROADCAST_TIMEOUT_MS", default_value_t = 5000)]
    pub broadcast_timeout_ms: u64,

    /// Messages queued per push-stream client before it is dropped.
    #[arg(long, env = "PTY_BRIDGE_CLIENT_QUEUE", default_value_t = 256)]
    pub client_queue: usize,

    /// Seconds to keep serving after the terminal exits before shutting down.
    #[arg(long, env = "PTY_BRIDGE_EXIT_LINGER_SECS", default_value_t = 5)]
    pub exit_linger_secs: u64,

    /// Base URL `user/repo` selectors are cloned from.
    #[arg(long, env = "PTY_BRIDGE_GIT_BASE_URL", default_value = "https://github.com/")]
    pub git_base_url: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub workspace_root: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub buffer_bytes: usize,
    pub broadcast_timeout: Duration,
    pub client_queue_depth: usize,
    pub exit_linger: Duration,
    pub git_base_url: String,
}

impl TryFrom<Cli> for BridgeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen))?;
        if cli.buffer_bytes == 0 {
            anyhow::bail!("--buffer-bytes must be greater than zero");
        }
        Ok(BridgeConfig {
            listen_addr,
            workspace_root: cli.workspace_root,
            program: cli.command.unwrap_or_else(default_shell),
            args: cli.args,
            buffer_bytes: cli.buffer_bytes,
            broadcast_timeout: Duration::from_millis(cli.broadcast_timeout_ms),
            client_queue_depth: cli.client_queue.max(1),
            exit_linger: Duration::from_secs(cli.exit_linger_secs),
            git_base_url: cli.git_base_url,
        })
    }
}

impl BridgeConfig {
    /// Loopback listener, a scratch workspace root and `/bin/sh`.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            workspace_root: std::env::temp_dir().join("pty-bridge-tests"),
            program: "/bin/sh".into(),
            args: Vec::new(),
            buffer_bytes: 1024 * 1024,
            broadcast_timeout: Duration::from_secs(5),
            client_queue_depth: 256,
            exit_linger: Duration::from_millis(0),
            git_base_url: "https://github.com/".into(),
        }
    }
}

/// `$SHELL`, else the first of bash/zsh/sh that exists.
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    for shell in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if std::path::Path::new(shell).exists() {
            return shell.to_string();
        }
    }
    "/bin/sh".to_string()
}
