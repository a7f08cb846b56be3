//! Per-connection relay between an SSH client terminal and the sandbox
//! backend WebSocket.
//!
//! A session moves `Unauthenticated → Authenticated → StreamNegotiating →
//! Streaming → Terminated`. Once streaming, four duties run side by side:
//! client input → `data`, backend frames → client, a `ping` ticker, and client
//! window changes → `resize`. A single writer task owns the WebSocket sink.
//! Client EOF only retires the input duty; any other duty ending cancels the
//! shared token and the rest unwind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use relay_proto::{headers, Geometry, Message};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    Message as WsMessage,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthOutcome;

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exit statuses reported to the SSH client when the relay itself ends the
/// session. A backend `exit` passes its own code through instead.
pub mod exit_code {
    pub const NORMAL: u32 = 0;
    pub const NO_PTY: u32 = 1;
    pub const AUTH_FAILED: u32 = 2;
    pub const AUTH_INDETERMINATE: u32 = 3;
    pub const BACKEND_UNAVAILABLE: u32 = 4;
}

const OUTBOUND_QUEUE: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid backend request: {0}")]
    Request(String),
    #[error("backend dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("backend refused the upgrade with HTTP {0}")]
    Refused(u16),
    #[error("backend dial failed: {0}")]
    Dial(#[source] tungstenite::Error),
    #[error("failed to send init: {0}")]
    Init(#[source] tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    StreamNegotiating,
    Streaming,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub worker_url: String,
    pub auth_secret: Option<String>,
    /// Zero disables the ping duty.
    pub ping_interval: Duration,
    pub dial_timeout: Duration,
}

/// What the transport learned about the connection before the session runs.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub fingerprint: Option<String>,
    pub auth: Option<AuthOutcome>,
    /// `None` when the client did not request a PTY.
    pub geometry: Option<Geometry>,
    pub repo: Option<String>,
}

/// Where the relay writes terminal output and user-facing notices.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn output(&self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Transport side of the client streams.
///
/// [`ClientEvents::end_input`] is the client's EOF: input stops but the
/// session keeps relaying backend output until `exit`. Dropping every handle
/// means the client went away and ends the session.
#[derive(Debug, Clone)]
pub struct ClientEvents {
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    resizes: mpsc::UnboundedSender<Geometry>,
}

impl ClientEvents {
    pub fn input(&self, bytes: &[u8]) -> bool {
        match &self.input {
            Some(input) => input.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    pub fn end_input(&mut self) {
        self.input = None;
    }

    pub fn resize(&self, geometry: Geometry) -> bool {
        self.resizes.send(geometry).is_ok()
    }
}

pub struct ClientStreams {
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    resizes: mpsc::UnboundedReceiver<Geometry>,
}

pub fn client_channel() -> (ClientEvents, ClientStreams) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (resize_tx, resize_rx) = mpsc::unbounded_channel();
    (
        ClientEvents {
            input: Some(input_tx),
            resizes: resize_tx,
        },
        ClientStreams {
            input: input_rx,
            resizes: resize_rx,
        },
    )
}

pub struct RelaySession {
    config: Arc<RelayConfig>,
    state: SessionState,
    label: String,
}

impl RelaySession {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            config,
            state: SessionState::Unauthenticated,
            label: String::from("-"),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.label, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Runs the session to completion and returns the exit status for the
    /// SSH client. Every failure is reported to the client as text first.
    pub async fn run(
        &mut self,
        request: SessionRequest,
        client: Arc<dyn ClientSink>,
        streams: ClientStreams,
    ) -> u32 {
        let code = self.run_inner(request, client, streams).await;
        self.transition(SessionState::Terminated);
        info!(session = %self.label, code, "session ended");
        code
    }

    async fn run_inner(
        &mut self,
        request: SessionRequest,
        client: Arc<dyn ClientSink>,
        streams: ClientStreams,
    ) -> u32 {
        let Some(fingerprint) = request.fingerprint.clone() else {
            notify(client.as_ref(), "Authentication failed\r\n").await;
            return exit_code::AUTH_FAILED;
        };
        self.label = short_fingerprint(&fingerprint).to_string();

        match &request.auth {
            Some(AuthOutcome::Accepted | AuthOutcome::Registered) => {}
            Some(AuthOutcome::Indeterminate(reason)) => {
                warn!(session = %self.label, reason = %reason, "key could not be verified");
                notify(
                    client.as_ref(),
                    "Could not verify your key right now. Please try again shortly.\r\n",
                )
                .await;
                return exit_code::AUTH_INDETERMINATE;
            }
            Some(AuthOutcome::Rejected) | None => {
                notify(client.as_ref(), "Authentication failed\r\n").await;
                return exit_code::AUTH_FAILED;
            }
        }
        self.transition(SessionState::Authenticated);

        let Some(geometry) = request.geometry else {
            notify(client.as_ref(), "PTY required. Use: ssh -t ...\r\n").await;
            return exit_code::NO_PTY;
        };

        info!(
            session = %self.label,
            cols = geometry.cols,
            rows = geometry.rows,
            repo = request.repo.as_deref().unwrap_or(""),
            "session starting"
        );

        self.transition(SessionState::StreamNegotiating);
        let backend = match self.dial(&fingerprint, geometry, request.repo.as_deref()).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(session = %self.label, error = %err, "backend dial failed");
                notify(client.as_ref(), "Failed to connect to backend\r\n").await;
                return exit_code::BACKEND_UNAVAILABLE;
            }
        };

        let (mut sink, stream) = backend.split();
        let init = Message::init(geometry, request.repo.clone());
        if let Err(err) = send_message(&mut sink, &init).await {
            let err = RelayError::Init(err);
            warn!(session = %self.label, error = %err, "init handshake failed");
            notify(client.as_ref(), "Failed to initialize session\r\n").await;
            return exit_code::BACKEND_UNAVAILABLE;
        }
        self.transition(SessionState::Streaming);

        match self.stream(sink, stream, client, streams).await {
            Some(code) => {
                info!(session = %self.label, code, "backend reported exit");
                client_exit_status(code)
            }
            None => exit_code::NORMAL,
        }
    }

    async fn dial(
        &self,
        fingerprint: &str,
        geometry: Geometry,
        repo: Option<&str>,
    ) -> Result<BackendStream, RelayError> {
        let mut request = self
            .config
            .worker_url
            .as_str()
            .into_client_request()
            .map_err(|err| RelayError::Request(err.to_string()))?;

        let mut metadata = vec![
            (headers::SESSION_ID, fingerprint.to_string()),
            (headers::COLS, geometry.cols.to_string()),
            (headers::ROWS, geometry.rows.to_string()),
        ];
        if let Some(repo) = repo {
            metadata.push((headers::REPO, repo.to_string()));
        }
        if let Some(secret) = self.config.auth_secret.as_deref().filter(|s| !s.is_empty()) {
            metadata.push((headers::AUTH_SECRET, secret.to_string()));
        }
        for (name, value) in metadata {
            let value = HeaderValue::from_str(&value)
                .map_err(|err| RelayError::Request(format!("{name}: {err}")))?;
            request
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }

        match tokio::time::timeout(self.config.dial_timeout, connect_async(request)).await {
            Err(_) => Err(RelayError::DialTimeout(self.config.dial_timeout)),
            Ok(Err(tungstenite::Error::Http(response))) => {
                Err(RelayError::Refused(response.status().as_u16()))
            }
            Ok(Err(err)) => Err(RelayError::Dial(err)),
            Ok(Ok((backend, _))) => Ok(backend),
        }
    }

    /// Returns the backend's exit code, or `None` if the session ended for
    /// any other reason.
    async fn stream(
        &self,
        sink: SplitSink<BackendStream, WsMessage>,
        stream: SplitStream<BackendStream>,
        client: Arc<dyn ClientSink>,
        streams: ClientStreams,
    ) -> Option<i32> {
        let done = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let label: Arc<str> = Arc::from(self.label.as_str());

        let writer = tokio::spawn(write_backend(sink, outbound_rx, done.clone()));
        let input = tokio::spawn(forward_input(streams.input, outbound.clone(), done.clone()));
        let resizes = tokio::spawn(forward_resizes(streams.resizes, outbound.clone(), done.clone()));
        let pinger: Option<JoinHandle<()>> = (!self.config.ping_interval.is_zero()).then(|| {
            tokio::spawn(send_pings(
                self.config.ping_interval,
                outbound.clone(),
                done.clone(),
            ))
        });
        drop(outbound);
        let reader = tokio::spawn(read_backend(stream, client, done.clone(), label));

        let code = reader.await.unwrap_or_else(|err| {
            warn!(error = %err, "backend reader task failed");
            None
        });
        done.cancel();
        let _ = input.await;
        let _ = resizes.await;
        if let Some(pinger) = pinger {
            let _ = pinger.await;
        }
        let _ = writer.await;
        code
    }
}

async fn forward_input(
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::Sender<Message>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            chunk = input.recv() => match chunk {
                // Forwarded as soon as it arrives; no coalescing.
                Some(bytes) => {
                    if outbound.send(Message::data(bytes)).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("client input closed");
                    return;
                }
            },
        }
    }
    done.cancel();
}

async fn forward_resizes(
    mut resizes: mpsc::UnboundedReceiver<Geometry>,
    outbound: mpsc::Sender<Message>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            geometry = resizes.recv() => match geometry {
                Some(geometry) => {
                    if outbound.send(Message::resize(geometry)).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("client went away");
                    break;
                }
            },
        }
    }
    done.cancel();
}

async fn send_pings(interval: Duration, outbound: mpsc::Sender<Message>, done: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {
                let ping = Message::ping(chrono::Utc::now().timestamp_millis());
                if outbound.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
    done.cancel();
}

async fn read_backend(
    mut stream: SplitStream<BackendStream>,
    client: Arc<dyn ClientSink>,
    done: CancellationToken,
    label: Arc<str>,
) -> Option<i32> {
    let code = loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break None,
            frame = stream.next() => frame,
        };
        let payload = match frame {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(bytes))) => bytes,
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!(session = %label, "backend closed the stream");
                break None;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(session = %label, error = %err, "backend read failed");
                break None;
            }
        };

        let message = match relay_proto::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %label, error = %err, "dropping malformed backend frame");
                continue;
            }
        };

        let delivered = match message {
            Message::Data { data } => client.output(&data).await,
            Message::Exit { code } => break Some(code),
            Message::Error { message } => {
                warn!(session = %label, message = %message, "backend error");
                client.output(format!("Error: {message}\r\n").as_bytes()).await
            }
            Message::Status { message } => {
                info!(session = %label, message = %message, "backend status");
                client.output(format!("\r{message}\r\n").as_bytes()).await
            }
            Message::Pong { .. } => Ok(()),
            other => {
                debug!(session = %label, kind = other.kind(), "ignoring backend message");
                Ok(())
            }
        };
        if let Err(err) = delivered {
            debug!(session = %label, error = %err, "client write failed");
            break None;
        }
    };
    done.cancel();
    code
}

async fn write_backend(
    mut sink: SplitSink<BackendStream, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    done: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(err) = send_message(&mut sink, &message).await {
            debug!(error = %err, "backend write failed");
            break;
        }
    }
    done.cancel();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

async fn send_message(
    sink: &mut SplitSink<BackendStream, WsMessage>,
    message: &Message,
) -> Result<(), tungstenite::Error> {
    let text = relay_proto::encode(message).map_err(|err| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })?;
    sink.send(WsMessage::Text(text)).await
}

async fn notify(client: &dyn ClientSink, text: &str) {
    if let Err(err) = client.output(text.as_bytes()).await {
        debug!(error = %err, "failed to deliver notice to client");
    }
}

/// Log label for a session: the first 16 characters of the fingerprint.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    match fingerprint.char_indices().nth(16) {
        Some((end, _)) => &fingerprint[..end],
        None => fingerprint,
    }
}

/// Negative backend codes (no status available) surface as a generic failure.
fn client_exit_status(code: i32) -> u32 {
    u32::try_from(code).unwrap_or(1)
}
