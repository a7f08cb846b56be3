//! Per-session forwarding between a relay WebSocket and the bridge.
//!
//! In stream mode frames are piped to the bridge's `/ws` endpoint. In poll
//! mode writes go through `POST /write` and a single poller task owns every
//! `GET /read`, so drained output reaches the relay in the order the bridge
//! produced it no matter whether a tick or a ping triggered the read.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::http::HeaderMap;
use futures_util::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use relay_proto::{headers, Geometry, Message, DEFAULT_COLS, DEFAULT_ROWS};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as BridgeFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge_client::{BridgeClient, BridgeError};
use crate::config::{Mode, ProxyConfig};

const RELAY_QUEUE_DEPTH: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bridge dial timed out")]
    DialTimeout,
    #[error("bridge dial failed: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Protocol(#[from] relay_proto::ProtocolError),
    #[error("relay write failed: {0}")]
    Relay(#[from] axum::Error),
}

/// Session metadata the relay sends as upgrade headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: Option<String>,
    pub geometry: Geometry,
    pub repo: Option<String>,
}

impl SessionMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let number = |name: &str, default: u16| {
            text(name)
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(i64::from(default))
        };
        Self {
            session_id: text(headers::SESSION_ID),
            geometry: Geometry::new(
                number(headers::COLS, DEFAULT_COLS),
                number(headers::ROWS, DEFAULT_ROWS),
            ),
            repo: text(headers::REPO),
        }
    }

    fn label(&self) -> &str {
        let id = self.session_id.as_deref().unwrap_or("anonymous");
        id.get(..16).unwrap_or(id)
    }
}

pub async fn run(socket: WebSocket, meta: SessionMeta, config: Arc<ProxyConfig>) {
    info!(
        session = meta.label(),
        cols = meta.geometry.cols,
        rows = meta.geometry.rows,
        repo = meta.repo.as_deref().unwrap_or(""),
        mode = ?config.mode,
        "relay session opened"
    );
    match config.mode {
        Mode::Stream => run_stream(socket, &meta, &config).await,
        Mode::Poll => run_poll(socket, &meta, &config).await,
    }
    info!(session = meta.label(), "relay session closed");
}

async fn dial_bridge(
    config: &ProxyConfig,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ProxyError,
> {
    let url = config.bridge_ws_url();
    match tokio::time::timeout(config.bridge_timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(err)) => Err(ProxyError::Dial(err)),
        Err(_) => Err(ProxyError::DialTimeout),
    }
}

async fn run_stream(socket: WebSocket, meta: &SessionMeta, config: &ProxyConfig) {
    let (mut relay_tx, mut relay_rx) = socket.split();

    let bridge = match dial_bridge(config).await {
        Ok(bridge) => bridge,
        Err(err) => {
            warn!(session = meta.label(), error = %err, "bridge unavailable");
            let _ = send_relay(
                &mut relay_tx,
                &Message::error(format!("Failed to connect to container: {err}")),
            )
            .await;
            close_relay(relay_tx).await;
            return;
        }
    };
    let (mut bridge_tx, mut bridge_rx) = bridge.split();

    let init = match relay_proto::encode(&Message::init(meta.geometry, meta.repo.clone())) {
        Ok(init) => init,
        Err(err) => {
            warn!(error = %err, "failed to encode init");
            return;
        }
    };
    if let Err(err) = bridge_tx.send(BridgeFrame::Text(init)).await {
        warn!(session = meta.label(), error = %err, "bridge init failed");
        let _ = send_relay(&mut relay_tx, &Message::error("Failed to initialize container")).await;
        close_relay(relay_tx).await;
        return;
    }

    loop {
        tokio::select! {
            frame = relay_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if bridge_tx.send(BridgeFrame::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if bridge_tx.send(BridgeFrame::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "relay read failed");
                    break;
                }
            },
            frame = bridge_rx.next() => match frame {
                Some(Ok(BridgeFrame::Text(text))) => {
                    let exited = matches!(relay_proto::decode(text.as_bytes()), Ok(Message::Exit { .. }));
                    if relay_tx.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                    if exited {
                        break;
                    }
                }
                Some(Ok(BridgeFrame::Binary(bytes))) => {
                    if relay_tx.send(WsMessage::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(BridgeFrame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "bridge read failed");
                    break;
                }
            },
        }
    }

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = bridge_tx.send(BridgeFrame::Close(None)).await;
        bridge_tx.close().await
    })
    .await;
    close_relay(relay_tx).await;
}

async fn run_poll(socket: WebSocket, meta: &SessionMeta, config: &ProxyConfig) {
    let (sink, mut inbound) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
    let done = CancellationToken::new();
    let writer = tokio::spawn(write_relay(sink, outbound_rx, done.clone()));

    let client = match BridgeClient::new(config.bridge_url.clone(), config.bridge_timeout) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to build bridge client");
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };

    match client.init(meta.geometry, meta.repo.clone()).await {
        Ok(report) => {
            debug!(session = meta.label(), resized = report.resized, pid = ?report.pid, "bridge initialized");
            if let Some(warning) = report.warning {
                let _ = outbound.send(Message::status(warning)).await;
            }
        }
        Err(err) => {
            warn!(session = meta.label(), error = %err, "bridge init failed");
            let _ = outbound
                .send(Message::error(format!("Failed to initialize container: {err}")))
                .await;
            drop(outbound);
            let _ = writer.await;
            return;
        }
    }

    let drain = Arc::new(Notify::new());
    let ticker = (!config.poll_interval.is_zero()).then(|| {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let poller = tokio::spawn(poll_output(
        client.clone(),
        outbound.clone(),
        ticker,
        drain.clone(),
        done.clone(),
    ));

    let mut session = PollSession {
        client,
        outbound,
        drain,
        drain_on_ping: config.drain_on_ping,
    };
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            frame = inbound.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if !session.handle_frame(text.as_bytes()).await {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if !session.handle_frame(&bytes).await {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "relay read failed");
                    break;
                }
            },
        }
    }

    done.cancel();
    let _ = poller.await;
    drop(session);
    let _ = writer.await;
}

struct PollSession {
    client: BridgeClient,
    outbound: mpsc::Sender<Message>,
    drain: Arc<Notify>,
    drain_on_ping: bool,
}

impl PollSession {
    /// Returns `false` when the session should end.
    async fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let message = match relay_proto::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed relay frame");
                return true;
            }
        };

        match message {
            Message::Data { .. } | Message::Resize { .. } => self.write(&message).await,
            Message::Init { cols, rows, .. } => {
                self.write(&Message::resize(Geometry::new(cols, rows))).await
            }
            Message::Ping { timestamp } => {
                if self.outbound.send(Message::pong(timestamp)).await.is_err() {
                    return false;
                }
                if self.drain_on_ping {
                    self.drain.notify_one();
                }
            }
            Message::Exit { .. } => return false,
            other => debug!(kind = other.kind(), "ignoring relay message"),
        }
        true
    }

    async fn write(&self, message: &Message) {
        if let Err(err) = self.client.write(message).await {
            debug!(error = %err, kind = message.kind(), "bridge write rejected");
            let text = match err {
                BridgeError::Status { message, .. } => message,
                other => other.to_string(),
            };
            let _ = self.outbound.send(Message::error(text)).await;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

/// Sole reader of the bridge buffer. Forwards drained lines and stops after
/// an `exit` line or when the bridge becomes unreachable.
async fn poll_output(
    client: BridgeClient,
    outbound: mpsc::Sender<Message>,
    mut ticker: Option<Interval>,
    drain: Arc<Notify>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = drain.notified() => {}
            _ = next_tick(&mut ticker) => {}
        }

        match client.read().await {
            Ok(messages) => {
                for message in messages {
                    let exited = matches!(message, Message::Exit { .. });
                    if outbound.send(message).await.is_err() || exited {
                        return;
                    }
                }
            }
            Err(BridgeError::Http(err)) => {
                warn!(error = %err, "bridge read failed; ending session");
                let _ = outbound
                    .send(Message::error(format!("Lost connection to container: {err}")))
                    .await;
                done.cancel();
                return;
            }
            Err(err) => warn!(error = %err, "bridge read rejected"),
        }
    }
}

/// Single writer for the relay socket. Ends after forwarding `exit`.
async fn write_relay(
    mut sink: SplitSink<WebSocket, WsMessage>,
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
        let is_exit = matches!(message, Message::Exit { .. });
        if let Err(err) = send_relay(&mut sink, &message).await {
            debug!(error = %err, "relay write failed");
            break;
        }
        if is_exit {
            break;
        }
    }

    done.cancel();
    close_relay(sink).await;
}

async fn send_relay(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    message: &Message,
) -> Result<(), ProxyError> {
    let text = relay_proto::encode(message)?;
    sink.send(WsMessage::Text(text)).await?;
    Ok(())
}

async fn close_relay(mut sink: SplitSink<WebSocket, WsMessage>) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(WsMessage::Close(None)).await;
        sink.close().await
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test_timeout::timeout]
    fn meta_reads_relay_headers() {
        let mut map = HeaderMap::new();
        map.insert("x-session-id", HeaderValue::from_static("SHA256:abcdefghijklmnopqrstuvwxyz"));
        map.insert("x-cols", HeaderValue::from_static("132"));
        map.insert("x-rows", HeaderValue::from_static("43"));
        map.insert("x-repo", HeaderValue::from_static("octo/widgets"));

        let meta = SessionMeta::from_headers(&map);
        assert_eq!(meta.geometry, Geometry::new(132, 43));
        assert_eq!(meta.repo.as_deref(), Some("octo/widgets"));
        assert_eq!(meta.label(), "SHA256:abcdefghi");
    }

    #[test_timeout::timeout]
    fn meta_defaults_missing_or_garbled_geometry() {
        let mut map = HeaderMap::new();
        map.insert("x-cols", HeaderValue::from_static("wide"));
        map.insert("x-repo", HeaderValue::from_static("  "));

        let meta = SessionMeta::from_headers(&map);
        assert_eq!(meta.geometry, Geometry::new(80, 24));
        assert_eq!(meta.repo, None);
        assert_eq!(meta.session_id, None);
        assert_eq!(meta.label(), "anonymous");
    }
}
