use std::sync::Arc;

use relay_proto::{Geometry, Message};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::config::BridgeConfig;
use crate::terminal::{Command, SpawnConfig, Terminal, TerminalError, TerminalOptions};
use crate::workspace::WorkspacePreparer;

/// Result of an initialize-or-resize request.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub ok: bool,
    pub resized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub workdir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub exists: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    pub clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// The single terminal slot of one sandbox instance. Built once at startup
/// and shared by every handler; the slot is filled by the first `init` and
/// never replaced.
pub struct Bridge {
    config: BridgeConfig,
    workspace: WorkspacePreparer,
    slot: watch::Sender<Option<Arc<Terminal>>>,
    init_gate: Mutex<()>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let workspace = WorkspacePreparer::new(&config.workspace_root, &config.git_base_url);
        let (slot, _) = watch::channel(None);
        Self {
            config,
            workspace,
            slot,
            init_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Arc<Terminal>> {
        self.slot.borrow().clone()
    }

    fn require(&self) -> Result<Arc<Terminal>, TerminalError> {
        self.current().ok_or(TerminalError::NotInitialized)
    }

    /// Spawns the terminal on first call. Later calls only resize it, so the
    /// process identity never changes for the life of the instance.
    pub async fn initialize(
        &self,
        geometry: Geometry,
        repo: Option<String>,
    ) -> Result<InitReport, TerminalError> {
        let _gate = self.init_gate.lock().await;

        if let Some(terminal) = self.current() {
            let (cols, rows) = terminal.resize(geometry)?;
            info!(cols, rows, pid = ?terminal.pid(), "terminal already running; init applied as resize");
            return Ok(InitReport {
                ok: true,
                resized: true,
                pid: terminal.pid(),
                cols,
                rows,
                workdir: terminal.workdir().display().to_string(),
                warning: None,
            });
        }

        let prepared = self.workspace.prepare(repo.as_deref()).await;
        let (cols, rows) = geometry.resolve();
        let command = Command::new(&self.config.program)
            .args(self.config.args.iter().cloned())
            .env("TERM", "xterm-256color")
            .env("COLORTERM", "truecolor")
            .cwd(&prepared.dir);
        let options = TerminalOptions {
            buffer_bytes: self.config.buffer_bytes,
            client_queue_depth: self.config.client_queue_depth,
        };

        // openpty and fork block; keep them off the runtime workers.
        let spawn = SpawnConfig::new(command, cols, rows);
        let terminal = tokio::task::spawn_blocking(move || Terminal::spawn(&spawn, options))
            .await
            .map_err(|err| TerminalError::Spawn(anyhow::anyhow!("spawn task failed: {err}")))??;
        let report = InitReport {
            ok: true,
            resized: false,
            pid: terminal.pid(),
            cols,
            rows,
            workdir: prepared.dir.display().to_string(),
            warning: prepared.warning,
        };
        self.slot.send_replace(Some(terminal));
        Ok(report)
    }

    /// Fire-and-forget write of a `data` or `resize` message.
    pub fn write(&self, message: &Message) -> Result<(), TerminalError> {
        self.require()?.apply(message)
    }

    pub fn resize(&self, geometry: Geometry) -> Result<(u16, u16), TerminalError> {
        self.require()?.resize(geometry)
    }

    /// Drains buffered output (and `exit`, once the process has ended).
    pub fn read(&self) -> Result<Vec<Message>, TerminalError> {
        Ok(self.require()?.poll())
    }

    /// Applies a write, then returns whatever output is queued right now.
    pub fn write_read(&self, message: &Message) -> Result<Vec<Message>, TerminalError> {
        let terminal = self.require()?;
        terminal.apply(message)?;
        Ok(terminal.poll())
    }

    pub fn status(&self) -> StatusReport {
        match self.current() {
            Some(terminal) => {
                let state = terminal.state();
                StatusReport {
                    exists: true,
                    running: state.running,
                    exit_code: state.exit_code,
                    workdir: Some(terminal.workdir().display().to_string()),
                    clients: terminal.client_count(),
                    pid: terminal.pid(),
                }
            }
            None => StatusReport {
                exists: false,
                running: false,
                exit_code: None,
                workdir: None,
                clients: 0,
                pid: None,
            },
        }
    }

    /// Resolves once a terminal has been spawned and has exited.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.slot.subscribe();
        let terminal = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match terminal {
            Some(terminal) => terminal.wait_exit().await,
            None => std::future::pending().await,
        }
    }

    pub fn shutdown(&self) {
        if let Some(terminal) = self.current() {
            terminal.kill();
        }
    }
}
