//! Push-stream attachment over WebSocket. Each connection owns one bounded
//! queue; the terminal broadcasts output into it and the connection's own
//! replies (`pong`, `error`, `status`) share it, so a single writer task keeps
//! the frame order intact.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use metrics::counter;
use relay_proto::{Geometry, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::routes::AppState;
use crate::terminal::{ClientHandle, Terminal};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_stream(socket, state.bridge))
}

struct Attachment {
    terminal: Arc<Terminal>,
    handle: ClientHandle,
}

struct StreamSession {
    bridge: Arc<Bridge>,
    outbound: mpsc::Sender<Message>,
    attachment: Option<Attachment>,
}

pub async fn serve_stream(socket: WebSocket, bridge: Arc<Bridge>) {
    let (sink, mut inbound) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(bridge.config().client_queue_depth);
    let done = CancellationToken::new();
    let writer = tokio::spawn(write_frames(
        sink,
        outbound_rx,
        bridge.config().broadcast_timeout,
        done.clone(),
    ));

    let mut session = StreamSession {
        bridge,
        outbound,
        attachment: None,
    };
    // Streams opened after init attach straight away.
    session.attach_if_running();

    loop {
        let evicted = session
            .attachment
            .as_ref()
            .map(|attachment| attachment.handle.evicted.clone())
            .unwrap_or_else(CancellationToken::new);

        tokio::select! {
            _ = done.cancelled() => break,
            _ = evicted.cancelled() => {
                warn!("stream fell behind terminal output; closing");
                break;
            }
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
                    debug!(error = %err, "stream read failed");
                    break;
                }
            },
        }
    }

    session.detach();
    done.cancel();
    let _ = writer.await;
}

impl StreamSession {
    fn attach_if_running(&mut self) {
        if self.attachment.is_some() {
            return;
        }
        if let Some(terminal) = self.bridge.current() {
            let handle = terminal.attach(self.outbound.clone());
            self.attachment = Some(Attachment { terminal, handle });
        }
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.terminal.detach(attachment.handle.id);
        }
    }

    fn reply(&self, message: Message) {
        if self.outbound.try_send(message).is_err() {
            debug!("stream queue full; reply dropped");
        }
    }

    /// Returns `false` when the stream should end.
    async fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let message = match relay_proto::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                counter!("pty_bridge_messages_dropped_total").increment(1);
                warn!(error = %err, "dropping malformed stream frame");
                return true;
            }
        };

        match message {
            Message::Init { cols, rows, repo } => {
                match self.bridge.initialize(Geometry::new(cols, rows), repo).await {
                    Ok(report) => {
                        if let Some(warning) = report.warning {
                            self.reply(Message::status(warning));
                        }
                        self.attach_if_running();
                    }
                    Err(err) => {
                        warn!(error = %err, "stream init failed");
                        self.reply(Message::error(err.to_string()));
                    }
                }
            }
            Message::Data { .. } | Message::Resize { .. } => {
                self.attach_if_running();
                if let Err(err) = self.bridge.write(&message) {
                    debug!(error = %err, kind = message.kind(), "stream write rejected");
                    self.reply(Message::error(err.to_string()));
                }
            }
            Message::Ping { timestamp } => self.reply(Message::pong(timestamp)),
            Message::Exit { .. } => {
                info!("stream client signalled exit");
                return false;
            }
            other => {
                debug!(kind = other.kind(), "ignoring stream message");
            }
        }
        true
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    send_timeout: Duration,
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
        let text = match relay_proto::encode(&message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode stream frame");
                continue;
            }
        };
        match tokio::time::timeout(send_timeout, sink.send(WsMessage::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "stream write failed");
                break;
            }
            Err(_) => {
                warn!(timeout_ms = send_timeout.as_millis() as u64, "stream write timed out");
                break;
            }
        }
        if is_exit {
            break;
        }
    }

    done.cancel();
    let _ = tokio::time::timeout(send_timeout, async {
        let _ = sink.send(WsMessage::Close(None)).await;
        sink.close().await
    })
    .await;
}
