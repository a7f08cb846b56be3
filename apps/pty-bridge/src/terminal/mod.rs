//! One terminal process bound to a PTY, with its output buffer and the set of
//! streams attached to it.
//!
//! Locking: the PTY handle (writes and resizes) has its own mutex; the output
//! buffer and client set each have theirs so output delivery never waits on
//! a slow write. Process state is read-mostly behind an `RwLock`. When exit is
//! recorded the client-set lock is held first, then the state lock, which is
//! the same order `attach` and output delivery use; a stream therefore sees
//! `exit` exactly once and never sees `data` after it.

mod clients;
mod output;
mod pty;

pub use clients::{BroadcastOutcome, ClientHandle, ClientId, ClientSet};
pub use output::OutputBuffer;
pub use pty::{Command, SpawnConfig};

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use portable_pty::{Child, ChildKiller};
use relay_proto::{Geometry, Message};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pty::PtyHandle;

const READ_CHUNK: usize = 32 * 1024;
/// How long the waiter lets the reader flush trailing output before `exit`.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to start terminal: {0:#}")]
    Spawn(anyhow::Error),
    #[error("terminal not initialized")]
    NotInitialized,
    #[error("terminal is not running")]
    NotRunning,
    #[error("pty write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("pty resize failed: {0:#}")]
    Resize(anyhow::Error),
    #[error("`{0}` messages are not accepted here")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessState {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct TerminalOptions {
    pub buffer_bytes: usize,
    pub client_queue_depth: usize,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            buffer_bytes: 1024 * 1024,
            client_queue_depth: 256,
        }
    }
}

pub struct Terminal {
    pty: Mutex<PtyHandle>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output: Mutex<OutputBuffer>,
    clients: Mutex<ClientSet>,
    state: RwLock<ProcessState>,
    exit_tx: watch::Sender<Option<i32>>,
    pid: Option<u32>,
    workdir: PathBuf,
    options: TerminalOptions,
}

impl Terminal {
    /// Spawns the process and starts the reader and waiter threads.
    pub fn spawn(config: &SpawnConfig, options: TerminalOptions) -> Result<Arc<Self>, TerminalError> {
        let spawned = pty::spawn(config).map_err(TerminalError::Spawn)?;
        let workdir = config
            .command
            .cwd
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let (exit_tx, _) = watch::channel(None);

        let terminal = Arc::new(Self {
            pty: Mutex::new(spawned.handle),
            killer: Mutex::new(spawned.killer),
            output: Mutex::new(OutputBuffer::new(options.buffer_bytes)),
            clients: Mutex::new(ClientSet::new()),
            state: RwLock::new(ProcessState {
                running: true,
                exit_code: None,
            }),
            exit_tx,
            pid: spawned.pid,
            workdir,
            options,
        });

        let (reader_done_tx, reader_done_rx) = std_mpsc::channel();
        spawn_reader(Arc::clone(&terminal), spawned.reader, reader_done_tx)
            .map_err(|err| TerminalError::Spawn(err.into()))?;
        spawn_waiter(Arc::clone(&terminal), spawned.child, reader_done_rx)
            .map_err(|err| TerminalError::Spawn(err.into()))?;

        info!(
            pid = ?terminal.pid,
            cols = config.cols,
            rows = config.rows,
            workdir = %terminal.workdir.display(),
            program = %config.command.program,
            "terminal started"
        );
        Ok(terminal)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn queue_depth(&self) -> usize {
        self.options.client_queue_depth
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        if !self.state().running {
            return Err(TerminalError::NotRunning);
        }
        self.pty.lock().write(bytes)?;
        Ok(())
    }

    pub fn resize(&self, geometry: Geometry) -> Result<(u16, u16), TerminalError> {
        let (cols, rows) = geometry.resolve();
        self.pty
            .lock()
            .resize(cols, rows)
            .map_err(TerminalError::Resize)?;
        debug!(cols, rows, "terminal resized");
        Ok((cols, rows))
    }

    /// Applies a `data` or `resize` message; anything else is rejected.
    pub fn apply(&self, message: &Message) -> Result<(), TerminalError> {
        match message {
            Message::Data { data } => self.write(data),
            Message::Resize { .. } => {
                let geometry = message.geometry().unwrap_or_default();
                self.resize(geometry).map(|_| ())
            }
            other => Err(TerminalError::Unsupported(other.kind())),
        }
    }

    /// Drains the output buffer for a polling consumer. Includes `exit` once
    /// the process has ended; state is sampled before draining so the exit
    /// never overtakes output that preceded it.
    pub fn poll(&self) -> Vec<Message> {
        let state = self.state();
        let drained = self.output.lock().drain();

        let mut messages = Vec::with_capacity(2);
        if !drained.is_empty() {
            messages.push(Message::data(drained));
        }
        if let Some(code) = state.exit_code {
            messages.push(Message::exit(code));
        }
        messages
    }

    /// Adds a push-stream client. A client attaching after exit is sent the
    /// `exit` immediately.
    pub fn attach(&self, sender: mpsc::Sender<Message>) -> ClientHandle {
        let mut clients = self.clients.lock();
        let exit_code = self.state.read().exit_code;
        if let Some(code) = exit_code {
            let _ = sender.try_send(Message::exit(code));
        }
        let handle = clients.attach(sender);
        info!(client = handle.id, clients = clients.len(), "stream attached");
        handle
    }

    pub fn detach(&self, id: ClientId) {
        let mut clients = self.clients.lock();
        if clients.detach(id) {
            info!(client = id, clients = clients.len(), "stream detached");
        }
    }

    /// Resolves with the exit code once the process has ended.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_tx.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => self.state().exit_code.unwrap_or(-1),
        };
        code
    }

    pub fn kill(&self) {
        if !self.state().running {
            return;
        }
        if let Err(err) = self.killer.lock().kill() {
            warn!(error = %err, "failed to kill terminal process");
        }
    }

    fn publish_output(&self, chunk: &[u8]) {
        let trimmed = self.output.lock().push(chunk);
        counter!("pty_bridge_output_bytes_total").increment(chunk.len() as u64);
        if trimmed > 0 {
            counter!("pty_bridge_output_trimmed_bytes_total").increment(trimmed as u64);
        }
        // Same lock order as `record_exit`: no `data` reaches a stream after
        // its `exit`, even when the reader outlives the drain grace.
        let mut clients = self.clients.lock();
        if self.state.read().exit_code.is_some() {
            debug!(bytes = chunk.len(), "output after exit kept for pollers only");
            return;
        }
        clients.broadcast(&Message::data(chunk.to_vec()));
    }

    fn record_exit(&self, code: i32) {
        let mut clients = self.clients.lock();
        if self.state.read().exit_code.is_some() {
            return;
        }
        *self.state.write() = ProcessState {
            running: false,
            exit_code: Some(code),
        };
        let outcome = clients.broadcast(&Message::exit(code));
        drop(clients);

        self.exit_tx.send_replace(Some(code));
        info!(code, notified = outcome.delivered, "terminal exited");
    }
}

fn spawn_reader(
    terminal: Arc<Terminal>,
    mut reader: Box<dyn Read + Send>,
    done: std_mpsc::Sender<()>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => terminal.publish_output(&buffer[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        // Linux reports EIO once the slave side is gone.
                        debug!(error = %err, "pty reader finished");
                        break;
                    }
                }
            }
            let _ = done.send(());
        })
}

fn spawn_waiter(
    terminal: Arc<Terminal>,
    mut child: Box<dyn Child + Send + Sync>,
    reader_done: std_mpsc::Receiver<()>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("pty-waiter".into())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                Err(err) => {
                    warn!(error = %err, "failed to wait for terminal process");
                    -1
                }
            };
            let _ = reader_done.recv_timeout(EXIT_DRAIN_GRACE);
            terminal.record_exit(code);
        })
}
