use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: Command,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnConfig {
    pub fn new(command: Command, cols: u16, rows: u16) -> Self {
        Self {
            command,
            cols,
            rows,
        }
    }
}

/// Write half of the PTY plus the master used for resizes. Both sit behind
/// the terminal's single PTY lock.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl PtyHandle {
    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master.resize(pty_size(cols, rows)).context("resize PTY")
    }
}

/// Everything produced by a spawn, handed out to the owners of each half.
pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub pid: Option<u32>,
}

pub fn spawn(config: &SpawnConfig) -> Result<SpawnedPty> {
    let mut pair = spawn_pair(config.rows, config.cols)?;
    let child = spawn_child(&mut pair, &config.command)?;
    // The slave end drops with `pair` so reads hit EOF once the child exits.
    let master = pair.master;
    let reader = master.try_clone_reader().context("clone PTY reader")?;
    let writer = master.take_writer().context("take PTY writer")?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    Ok(SpawnedPty {
        handle: PtyHandle { master, writer },
        reader,
        child,
        killer,
        pid,
    })
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_pair(rows: u16, cols: u16) -> Result<PtyPair> {
    native_pty_system()
        .openpty(pty_size(cols, rows))
        .context("open PTY pair")
}

fn spawn_child(pair: &mut PtyPair, command: &Command) -> Result<Box<dyn Child + Send + Sync>> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &command.cwd {
        cmd.cwd(Path::new(cwd));
    }
    pair.slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn `{}` in PTY", command.program))
}
