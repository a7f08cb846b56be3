use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumWs, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use relay_proto::{Geometry, Message};
use ssh_relay::auth::AuthOutcome;
use ssh_relay::session::{
    client_channel, exit_code, ClientSink, RelayConfig, RelaySession, SessionRequest,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Terminal(Mutex<Vec<u8>>);

impl Terminal {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[async_trait]
impl ClientSink for Terminal {
    async fn output(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

async fn spawn_backend<F, Fut>(script: F) -> SocketAddr
where
    F: Fn(WebSocket, HeaderMap) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let router = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade, headers: HeaderMap| {
            let script = script.clone();
            async move {
                if headers.get("x-auth-secret").map(|v| v.as_bytes()) == Some(b"wrong") {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                ws.on_upgrade(move |socket| script(socket, headers))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

fn config(addr: SocketAddr, ping_ms: u64) -> Arc<RelayConfig> {
    Arc::new(RelayConfig {
        worker_url: format!("ws://{addr}/ws"),
        auth_secret: Some("s3cret".into()),
        ping_interval: Duration::from_millis(ping_ms),
        dial_timeout: Duration::from_secs(5),
    })
}

fn request(repo: Option<&str>) -> SessionRequest {
    SessionRequest {
        fingerprint: Some("SHA256:AAAAbbbbCCCCddddEEEE".into()),
        auth: Some(AuthOutcome::Accepted),
        geometry: Some(Geometry::new(120, 40)),
        repo: repo.map(str::to_string),
    }
}

async fn send(socket: &mut WebSocket, message: &Message) {
    let text = relay_proto::encode(message).unwrap();
    socket.send(AxumWs::Text(text)).await.unwrap();
}

async fn recv(socket: &mut WebSocket) -> Option<Message> {
    loop {
        match socket.recv().await? {
            Ok(AxumWs::Text(text)) => return Some(relay_proto::decode(text.as_bytes()).unwrap()),
            Ok(AxumWs::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn sends_metadata_and_init_then_relays_output_and_exit_code() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let addr = spawn_backend(move |mut socket, headers| {
        let seen_tx = seen_tx.clone();
        async move {
            let first = recv(&mut socket).await;
            let _ = seen_tx.send((headers, first));
            send(&mut socket, &Message::status("Cloning octo/widgets...")).await;
            send(&mut socket, &Message::data(b"hello".to_vec())).await;
            send(&mut socket, &Message::pong(1)).await;
            socket.send(AxumWs::Text("{not json".into())).await.unwrap();
            send(&mut socket, &Message::data(b" world".to_vec())).await;
            send(&mut socket, &Message::error("disk almost full")).await;
            send(&mut socket, &Message::exit(3)).await;
            while recv(&mut socket).await.is_some() {}
        }
    })
    .await;

    let terminal = Arc::new(Terminal::default());
    let (_events, streams) = client_channel();
    let mut session = RelaySession::new(config(addr, 0));
    let code = session
        .run(request(Some("octo/widgets")), terminal.clone(), streams)
        .await;

    assert_eq!(code, 3);
    assert_eq!(
        terminal.text(),
        "\rCloning octo/widgets...\r\nhello worldError: disk almost full\r\n"
    );

    let (headers, first) = seen_rx.recv().await.unwrap();
    assert_eq!(headers["x-session-id"], "SHA256:AAAAbbbbCCCCddddEEEE");
    assert_eq!(headers["x-cols"], "120");
    assert_eq!(headers["x-rows"], "40");
    assert_eq!(headers["x-repo"], "octo/widgets");
    assert_eq!(headers["x-auth-secret"], "s3cret");
    assert_eq!(
        first,
        Some(Message::init(Geometry::new(120, 40), Some("octo/widgets".into())))
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn client_input_resizes_and_pings_reach_backend() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let addr = spawn_backend(move |mut socket, _headers| {
        let frames_tx = frames_tx.clone();
        async move {
            while let Some(message) = recv(&mut socket).await {
                let finished = message == Message::data(b"q".to_vec());
                let _ = frames_tx.send(message);
                if finished {
                    send(&mut socket, &Message::exit(0)).await;
                }
            }
        }
    })
    .await;

    let terminal = Arc::new(Terminal::default());
    let (events, streams) = client_channel();
    let relay = tokio::spawn(async move {
        let mut session = RelaySession::new(config(addr, 20));
        session.run(request(None), terminal, streams).await
    });

    assert!(matches!(frames_rx.recv().await, Some(Message::Init { .. })));
    events.input(b"ls\r");
    events.resize(Geometry::new(100, 30));

    let mut saw_ls = false;
    let mut saw_resize = false;
    let mut pings = 0;
    while !(saw_ls && saw_resize && pings >= 2) {
        match frames_rx.recv().await.unwrap() {
            Message::Data { data } => {
                assert_eq!(data, b"ls\r");
                saw_ls = true;
            }
            Message::Resize { cols, rows } => {
                assert_eq!((cols, rows), (100, 30));
                saw_resize = true;
            }
            Message::Ping { timestamp } => {
                assert!(timestamp > 0);
                pings += 1;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    events.input(b"q");
    let code = tokio::time::timeout(Duration::from_secs(10), relay)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn refused_upgrade_is_reported_as_backend_failure() {
    let addr = spawn_backend(|_socket, _headers| async {}).await;
    let mut config = (*config(addr, 0)).clone();
    config.auth_secret = Some("wrong".into());

    let terminal = Arc::new(Terminal::default());
    let (_events, streams) = client_channel();
    let mut session = RelaySession::new(Arc::new(config));
    let code = session.run(request(None), terminal.clone(), streams).await;

    assert_eq!(code, exit_code::BACKEND_UNAVAILABLE);
    assert_eq!(terminal.text(), "Failed to connect to backend\r\n");
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_backend_differs_from_auth_failure() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let terminal = Arc::new(Terminal::default());
    let (_events, streams) = client_channel();
    let mut session = RelaySession::new(config(addr, 0));
    let code = session.run(request(None), terminal, streams).await;
    assert_eq!(code, exit_code::BACKEND_UNAVAILABLE);
    assert_ne!(code, exit_code::AUTH_FAILED);
}

#[test_timeout::tokio_timeout_test(30)]
async fn client_disconnect_closes_backend_stream() {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let addr = spawn_backend(move |mut socket, _headers| {
        let closed_tx = closed_tx.clone();
        async move {
            while recv(&mut socket).await.is_some() {}
            let _ = closed_tx.send(());
        }
    })
    .await;

    let terminal = Arc::new(Terminal::default());
    let (events, streams) = client_channel();
    let relay = tokio::spawn(async move {
        let mut session = RelaySession::new(config(addr, 50));
        session.run(request(None), terminal, streams).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(events);

    assert_eq!(relay.await.unwrap(), exit_code::NORMAL);
    tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn client_eof_keeps_relaying_until_backend_exit() {
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let addr = spawn_backend(move |mut socket, _headers| {
        let input_tx = input_tx.clone();
        async move {
            while let Some(message) = recv(&mut socket).await {
                if let Message::Data { data } = message {
                    let _ = input_tx.send(data);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            send(&mut socket, &Message::data(b"build done".to_vec())).await;
            send(&mut socket, &Message::exit(2)).await;
            while recv(&mut socket).await.is_some() {}
        }
    })
    .await;

    let terminal = Arc::new(Terminal::default());
    let (mut events, streams) = client_channel();
    let sink = terminal.clone();
    let relay = tokio::spawn(async move {
        let mut session = RelaySession::new(config(addr, 50));
        session.run(request(None), sink, streams).await
    });

    // `echo make | ssh -tt`: the input arrives followed at once by EOF.
    events.input(b"make\n");
    events.end_input();
    assert!(!events.input(b"ignored"));

    assert_eq!(input_rx.recv().await.unwrap(), b"make\n");
    // Window changes still reach the backend after EOF.
    assert!(events.resize(Geometry::new(90, 20)));

    let code = relay.await.unwrap();
    assert_eq!(code, 2);
    assert_eq!(terminal.text(), "build done");
    drop(events);
}

#[test_timeout::tokio_timeout_test(30)]
async fn backend_close_without_exit_ends_session_normally() {
    let addr = spawn_backend(|mut socket, _headers| async move {
        let _ = recv(&mut socket).await;
        send(&mut socket, &Message::data(b"bye".to_vec())).await;
        let _ = socket.send(AxumWs::Close(None)).await;
    })
    .await;

    let terminal = Arc::new(Terminal::default());
    let (_events, streams) = client_channel();
    let mut session = RelaySession::new(config(addr, 0));
    let code = session.run(request(None), terminal.clone(), streams).await;
    assert_eq!(code, exit_code::NORMAL);
    assert_eq!(terminal.text(), "bye");
}
