use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumWs, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use relay_proto::{Geometry, Message};
use russh::server::Server as _;
use russh::{client, Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};
use ssh_relay::auth::Authorizer;
use ssh_relay::registry::KeyRegistry;
use ssh_relay::server::RelayServer;
use ssh_relay::session::RelayConfig;
use tokio::sync::mpsc;

struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Everything the backend saw on one upgrade: headers, then each frame.
#[derive(Debug)]
enum Seen {
    Connected(HeaderMap),
    Frame(Message),
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

/// Reports every upgrade and frame on `seen`; `script` decides replies.
async fn spawn_backend<F, Fut>(script: F) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>)
where
    F: Fn(WebSocket, mpsc::UnboundedSender<Seen>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let router = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade, headers: HeaderMap| {
            let script = script.clone();
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(Seen::Connected(headers));
                ws.on_upgrade(move |socket| script(socket, seen_tx))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (addr, seen_rx)
}

async fn start_relay(backend: SocketAddr, auto_register: bool) -> (SocketAddr, KeyRegistry) {
    let registry = KeyRegistry::in_memory().await.unwrap();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut server = RelayServer::new(
        Authorizer::new(registry.clone(), auto_register),
        RelayConfig {
            worker_url: format!("ws://{backend}/ws"),
            auth_secret: None,
            ping_interval: Duration::ZERO,
            dial_timeout: Duration::from_secs(5),
        },
    );
    let config = ssh_relay::ssh_config(KeyPair::generate_ed25519().unwrap());
    tokio::spawn(async move {
        let _ = server.run_on_address(config, addr).await;
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let config = Arc::new(client::Config::default());
    for _ in 0..100 {
        match client::connect(config.clone(), addr, TrustingClient).await {
            Ok(handle) => return handle,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("ssh-relay never accepted connections on {addr}");
}

struct Login {
    ssh: client::Handle<TrustingClient>,
    fingerprint: String,
}

async fn login(addr: SocketAddr) -> Login {
    let key = Arc::new(KeyPair::generate_ed25519().unwrap());
    let fingerprint = format!("SHA256:{}", key.clone_public_key().unwrap().fingerprint());
    let mut ssh = connect(addr).await;
    assert!(ssh.authenticate_publickey("dev", key).await.unwrap());
    Login { ssh, fingerprint }
}

#[derive(Debug, Default)]
struct Transcript {
    output: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
}

impl Transcript {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Reads the channel until the relay closes it.
async fn transcript(channel: &mut Channel<client::Msg>) -> Transcript {
    let mut seen = Transcript::default();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => seen.output.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => seen.exit_status = Some(exit_status),
            Some(ChannelMsg::Eof) => seen.eof = true,
            Some(ChannelMsg::Close) | None => return seen,
            Some(_) => {}
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[test_timeout::tokio_timeout_test(60)]
async fn shell_session_registers_key_and_relays_both_ways() {
    let (backend, mut seen) = spawn_backend(|mut socket, seen_tx| async move {
        let (mut saw_input, mut saw_resize) = (false, false);
        while let Some(message) = recv(&mut socket).await {
            saw_input |= matches!(message, Message::Data { .. });
            saw_resize |= matches!(message, Message::Resize { .. });
            let _ = seen_tx.send(Seen::Frame(message));
            if saw_input && saw_resize {
                send(&mut socket, &Message::data(b"hi".to_vec())).await;
                send(&mut socket, &Message::exit(3)).await;
                break;
            }
        }
        while recv(&mut socket).await.is_some() {}
    })
    .await;
    let (relay, registry) = start_relay(backend, true).await;

    let Login { ssh, fingerprint } = login(relay).await;
    assert!(registry.exists(&fingerprint).await.unwrap());

    let mut channel = ssh.channel_open_session().await.unwrap();
    channel.request_pty(true, "xterm", 100, 30, 0, 0, &[]).await.unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(&b"ls\r"[..]).await.unwrap();
    channel.window_change(120, 40, 0, 0).await.unwrap();

    let result = transcript(&mut channel).await;
    assert_eq!(result.text(), "hi");
    assert_eq!(result.exit_status, Some(3));
    assert!(result.eof);

    let Some(Seen::Connected(headers)) = seen.recv().await else {
        panic!("backend was not dialed");
    };
    assert_eq!(header(&headers, "x-session-id"), Some(fingerprint.as_str()));
    assert_eq!(header(&headers, "x-cols"), Some("100"));
    assert_eq!(header(&headers, "x-rows"), Some("30"));
    assert_eq!(header(&headers, "x-repo"), None);

    let mut frames = Vec::new();
    while let Ok(Seen::Frame(message)) = seen.try_recv() {
        frames.push(message);
    }
    assert_eq!(frames.first(), Some(&Message::init(Geometry::new(100, 30), None)));
    assert!(frames.contains(&Message::data(b"ls\r".to_vec())));
    assert!(frames.contains(&Message::resize(Geometry::new(120, 40))));
}

#[test_timeout::tokio_timeout_test(60)]
async fn exec_command_selects_the_workspace() {
    let (backend, mut seen) = spawn_backend(|mut socket, seen_tx| async move {
        if let Some(message) = recv(&mut socket).await {
            let _ = seen_tx.send(Seen::Frame(message));
        }
        send(&mut socket, &Message::exit(0)).await;
        while recv(&mut socket).await.is_some() {}
    })
    .await;
    let (relay, _registry) = start_relay(backend, true).await;

    let Login { ssh, .. } = login(relay).await;
    let mut channel = ssh.channel_open_session().await.unwrap();
    channel.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await.unwrap();
    channel
        .exec(true, "https://github.com/octo/widgets.git")
        .await
        .unwrap();

    let result = transcript(&mut channel).await;
    assert_eq!(result.exit_status, Some(0));

    let Some(Seen::Connected(headers)) = seen.recv().await else {
        panic!("backend was not dialed");
    };
    assert_eq!(header(&headers, "x-repo"), Some("octo/widgets"));
    let Some(Seen::Frame(init)) = seen.recv().await else {
        panic!("no init frame");
    };
    assert_eq!(
        init,
        Message::init(Geometry::new(80, 24), Some("octo/widgets".into()))
    );
}

#[test_timeout::tokio_timeout_test(60)]
async fn shell_without_pty_exits_with_one_and_never_dials() {
    let (backend, mut seen) = spawn_backend(|mut socket, _seen_tx| async move {
        while recv(&mut socket).await.is_some() {}
    })
    .await;
    let (relay, _registry) = start_relay(backend, true).await;

    let Login { ssh, .. } = login(relay).await;
    let mut channel = ssh.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();

    let result = transcript(&mut channel).await;
    assert_eq!(result.text(), "PTY required. Use: ssh -t ...\r\n");
    assert_eq!(result.exit_status, Some(1));
    assert!(seen.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(60)]
async fn unknown_key_is_refused_when_registration_is_closed() {
    let (backend, mut seen) = spawn_backend(|mut socket, _seen_tx| async move {
        while recv(&mut socket).await.is_some() {}
    })
    .await;
    let (relay, registry) = start_relay(backend, false).await;

    let key = Arc::new(KeyPair::generate_ed25519().unwrap());
    let mut ssh = connect(relay).await;
    assert!(!ssh.authenticate_publickey("dev", key).await.unwrap());
    assert_eq!(registry.count().await.unwrap(), 0);
    assert!(seen.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(60)]
async fn client_eof_still_receives_output_and_exit_status() {
    let (backend, _seen) = spawn_backend(|mut socket, _seen_tx| async move {
        while let Some(message) = recv(&mut socket).await {
            if matches!(message, Message::Data { .. }) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        send(&mut socket, &Message::data(b"build done".to_vec())).await;
        send(&mut socket, &Message::exit(2)).await;
        while recv(&mut socket).await.is_some() {}
    })
    .await;
    let (relay, _registry) = start_relay(backend, true).await;

    let Login { ssh, .. } = login(relay).await;
    let mut channel = ssh.channel_open_session().await.unwrap();
    channel.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await.unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(&b"make\n"[..]).await.unwrap();
    channel.eof().await.unwrap();

    let result = transcript(&mut channel).await;
    assert_eq!(result.text(), "build done");
    assert_eq!(result.exit_status, Some(2));
}
