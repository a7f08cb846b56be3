use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use pty_bridge::bridge::Bridge;
use pty_bridge::config::BridgeConfig;
use pty_bridge::routes::{build_router, AppState};
use relay_proto::Message;
use serde_json::Value;
use tower::ServiceExt;

fn app_running(script: &str) -> (Router, Arc<Bridge>) {
    let mut config = BridgeConfig::for_tests();
    config.args = vec!["-c".into(), script.into()];
    let bridge = Arc::new(Bridge::new(config));
    let router = build_router(AppState {
        bridge: bridge.clone(),
        metrics: None,
    });
    (router, bridge)
}

async fn call(app: &Router, method: &str, uri: &str, body: String) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn data_frame(bytes: &[u8]) -> String {
    relay_proto::encode(&Message::data(bytes.to_vec())).unwrap()
}

/// Polls `/read` until `done` accepts the accumulated output or an exit arrives.
async fn read_until(app: &Router, done: impl Fn(&[u8]) -> bool) -> (Vec<u8>, Option<i32>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut output = Vec::new();
    loop {
        let (status, body) = call(app, "GET", "/read", String::new()).await;
        assert_eq!(status, StatusCode::OK);
        for message in relay_proto::decode_lines(&body) {
            match message.unwrap() {
                Message::Data { data } => output.extend(data),
                Message::Exit { code } => return (output, Some(code)),
                other => panic!("unexpected message {other:?}"),
            }
        }
        if done(&output) {
            return (output, None);
        }
        assert!(Instant::now() < deadline, "timed out waiting for output");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    String::from_utf8_lossy(haystack).contains(needle)
}

#[test_timeout::tokio_timeout_test(60)]
async fn second_init_keeps_process_and_resizes() {
    let (app, bridge) = app_running("sleep 10");

    let (status, body) = call(&app, "POST", "/init", r#"{"type":"init","cols":80,"rows":24}"#.into()).await;
    assert_eq!(status, StatusCode::OK);
    let first: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(first["resized"], Value::Bool(false));

    let (status, body) = call(&app, "POST", "/init", r#"{"type":"init","cols":132,"rows":43}"#.into()).await;
    assert_eq!(status, StatusCode::OK);
    let second: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(second["resized"], Value::Bool(true));
    assert_eq!(second["cols"], 132);
    assert_eq!(second["rows"], 43);
    assert_eq!(first["pid"], second["pid"]);

    bridge.shutdown();
}

#[test_timeout::tokio_timeout_test(60)]
async fn write_then_read_returns_process_output() {
    let (app, bridge) = app_running("read line; echo \"got:$line\"; sleep 10");
    call(&app, "POST", "/init", String::new()).await;

    let (status, _) = call(&app, "POST", "/write", data_frame(b"hello\r")).await;
    assert_eq!(status, StatusCode::OK);
    let (output, exit) = read_until(&app, |out| contains(out, "got:hello")).await;
    assert!(contains(&output, "got:hello"));
    assert_eq!(exit, None);

    let (status, body) = call(&app, "POST", "/resize", r#"{"type":"resize","cols":100,"rows":30}"#.into()).await;
    assert_eq!(status, StatusCode::OK);
    let resized: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(resized["cols"], 100);

    let (_, body) = call(&app, "GET", "/status", String::new()).await;
    let status: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["exists"], Value::Bool(true));
    assert_eq!(status["running"], Value::Bool(true));

    bridge.shutdown();
}

#[test_timeout::tokio_timeout_test(60)]
async fn write_read_and_exit_code_reach_poller() {
    let (app, _bridge) = app_running("read line; echo \"bye:$line\"; exit 2");
    call(&app, "POST", "/init", String::new()).await;

    let (status, body) = call(&app, "POST", "/write-read", data_frame(b"now\r")).await;
    assert_eq!(status, StatusCode::OK);
    let mut output = Vec::new();
    let mut exit = None;
    for message in relay_proto::decode_lines(&body) {
        match message.unwrap() {
            Message::Data { data } => output.extend(data),
            Message::Exit { code } => exit = Some(code),
            other => panic!("unexpected message {other:?}"),
        }
    }
    if exit.is_none() {
        let (more, code) = read_until(&app, |_| false).await;
        output.extend(more);
        exit = code;
    }
    assert!(contains(&output, "bye:now"));
    assert_eq!(exit, Some(2));

    let (_, body) = call(&app, "GET", "/status", String::new()).await;
    let status: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["running"], Value::Bool(false));
    assert_eq!(status["exit_code"], 2);

    let (status, body) = call(&app, "POST", "/write", data_frame(b"late")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        relay_proto::decode(&body).unwrap(),
        Message::error("terminal is not running")
    );
}

#[test_timeout::tokio_timeout_test(60)]
async fn unknown_message_type_is_rejected_without_side_effects() {
    let (app, bridge) = app_running("sleep 10");
    call(&app, "POST", "/init", String::new()).await;

    let (status, _) = call(&app, "POST", "/write", r#"{"type":"launch"}"#.into()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "POST", "/write", r#"{"type":"ping","timestamp":1}"#.into()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(bridge.status().running);

    bridge.shutdown();
}
