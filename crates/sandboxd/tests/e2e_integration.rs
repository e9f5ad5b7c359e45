//! End-to-end integration tests for sandboxd.
//!
//! These tests boot the orchestrator on an ephemeral port and drive it the
//! way a client would:
//! - HTTP resource management (terminals, watchers, signals)
//! - WebSocket subscriptions and fan-out
//! - Terminal control over the socket
//! - Error shapes

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::api::{
    ErrorResponse, ExecuteResponse, HealthResponse, SignalStatus, SignalStatusResponse,
    TerminalResponse, TerminalStatus, WatcherResponse,
};
use protocol::messages::{event_types, ServerEvent};
use sandboxd::config::Config;
use sandboxd::orchestrator::{DaemonOrchestrator, OrchestratorState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    orchestrator: DaemonOrchestrator,
    base: String,
    ws_url: String,
    http: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.terminal.default_shell = "/bin/sh".to_string();
        config.watcher.settle_delay_ms = 20;

        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        orchestrator.start().await.unwrap();
        let addr = orchestrator.local_addr().unwrap();

        Self {
            orchestrator,
            base: format!("http://{}", addr),
            ws_url: format!("ws://{}/ws", addr),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn connect(&self) -> Ws {
        let (mut ws, _) = connect_async(self.ws_url.as_str()).await.unwrap();
        let hello = next_event(&mut ws, |e| e.event_type == event_types::CONNECTED).await;
        assert!(hello.data["connection_id"].as_str().is_some());
        ws
    }

    async fn create_terminal(&self) -> TerminalResponse {
        let resp = self
            .http
            .post(self.url("/terminals"))
            .json(&json!({"shell": "/bin/sh"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    async fn stop(mut self) {
        self.orchestrator.stop().await.unwrap();
        assert_eq!(self.orchestrator.state().await, OrchestratorState::Stopped);
    }
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Reads frames until one matches `pred`.
async fn next_event(ws: &mut Ws, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event = ServerEvent::decode(&text).unwrap();
                    if pred(&event) {
                        return event;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for event: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn subscribe(ws: &mut Ws, channel: &str) {
    send(ws, json!({"type": "subscribe", "data": {"channel": channel}})).await;
    let ack = next_event(ws, |e| e.event_type == event_types::SUBSCRIBED).await;
    assert_eq!(ack.data["channel"], channel);
}

/// Accumulates `terminal:output` on `channel` until it contains `needle`.
async fn wait_for_output(ws: &mut Ws, channel: &str, needle: &str) {
    let mut seen = String::new();
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !seen.contains(needle) {
            let event = next_event(ws, |e| {
                e.event_type == event_types::TERMINAL_OUTPUT && e.channel.as_deref() == Some(channel)
            })
            .await;
            seen.push_str(event.data["data"].as_str().unwrap_or_default());
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {:?} in output: {:?}", needle, seen));
}

// =============================================================================
// Health and Error Shape Tests
// =============================================================================

#[tokio::test]
async fn test_health_reports_counts() {
    let server = TestServer::start().await;
    let _ws = server.connect().await;

    let health: HealthResponse = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.terminals, 0);
    assert_eq!(health.watchers, 0);
    assert_eq!(health.connections, 1);
    assert_eq!(health.signals, SignalStatus::Stopped);

    server.stop().await;
}

#[tokio::test]
async fn test_structured_errors() {
    let server = TestServer::start().await;

    let resp = server
        .http
        .get(server.url("/terminals/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(body.code, "NOT_FOUND");
    assert!(body.error.contains("does-not-exist"));

    let resp = server.http.get(server.url("/nowhere")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(body.code, "NOT_FOUND");

    let resp = server
        .http
        .post(server.url("/watchers"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(body.code, "VALIDATION_ERROR");

    let resp = server
        .http
        .post(server.url("/terminals"))
        .json(&json!({"cols": 0, "rows": 24}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    server.stop().await;
}

// =============================================================================
// Terminal Tests
// =============================================================================

#[tokio::test]
async fn test_terminal_output_fans_out_to_subscribers() {
    let server = TestServer::start().await;
    let terminal = server.create_terminal().await;
    assert_eq!(terminal.status, TerminalStatus::Active);
    assert_eq!(terminal.channel, format!("terminal:{}", terminal.id));

    let mut first = server.connect().await;
    let mut second = server.connect().await;
    subscribe(&mut first, &terminal.channel).await;
    subscribe(&mut second, &terminal.channel).await;

    let resp = server
        .http
        .post(server.url(&format!("/terminals/{}/input", terminal.id)))
        .json(&json!({"input": "echo fan-$((6*7))\n"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    wait_for_output(&mut first, &terminal.channel, "fan-42").await;
    wait_for_output(&mut second, &terminal.channel, "fan-42").await;

    // One subscriber leaving must not disturb the other.
    drop(first);
    server
        .http
        .post(server.url(&format!("/terminals/{}/input", terminal.id)))
        .json(&json!({"input": "echo again-$((7*7))\n"}))
        .send()
        .await
        .unwrap();
    wait_for_output(&mut second, &terminal.channel, "again-49").await;

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_control_over_websocket() {
    let server = TestServer::start().await;
    let terminal = server.create_terminal().await;

    let mut ws = server.connect().await;
    subscribe(&mut ws, &terminal.channel).await;

    send(
        &mut ws,
        json!({"type": "terminal:resize", "data": {"terminal_id": terminal.id, "rows": 40, "cols": 120}}),
    )
    .await;
    send(
        &mut ws,
        json!({"type": "terminal:input", "data": {"terminal_id": terminal.id, "input": "echo ws-$((5*5))\n"}}),
    )
    .await;
    wait_for_output(&mut ws, &terminal.channel, "ws-25").await;

    let info: TerminalResponse = server
        .http
        .get(server.url(&format!("/terminals/{}", terminal.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!((info.rows, info.cols), (40, 120));

    send(
        &mut ws,
        json!({"type": "terminal:input", "data": {"terminal_id": "missing", "input": "x"}}),
    )
    .await;
    let err = next_event(&mut ws, |e| e.event_type == event_types::ERROR).await;
    assert!(err.data["message"].as_str().unwrap().contains("missing"));

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_execute_publishes_result() {
    let server = TestServer::start().await;
    let terminal = server.create_terminal().await;

    let mut ws = server.connect().await;
    subscribe(&mut ws, &terminal.channel).await;

    let result: ExecuteResponse = server
        .http
        .post(server.url(&format!("/terminals/{}/execute", terminal.id)))
        .json(&json!({"command": "echo executed; exit 3"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(result.output.contains("executed"));
    assert_eq!(result.exit_code, 3);

    let event = next_event(&mut ws, |e| e.event_type == event_types::TERMINAL_EXECUTE).await;
    assert_eq!(event.data["terminal_id"], terminal.id.as_str());
    assert_eq!(event.data["exit_code"], 3);

    server.stop().await;
}

#[tokio::test]
async fn test_terminal_exit_and_delete() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    let terminal = server.create_terminal().await;
    let created = next_event(&mut ws, |e| e.event_type == event_types::TERMINAL_CREATED).await;
    assert_eq!(created.data["id"], terminal.id.as_str());
    assert!(created.channel.is_none());

    subscribe(&mut ws, &terminal.channel).await;
    server
        .http
        .post(server.url(&format!("/terminals/{}/input", terminal.id)))
        .json(&json!({"input": "exit 5\n"}))
        .send()
        .await
        .unwrap();

    let exited = next_event(&mut ws, |e| e.event_type == event_types::TERMINAL_EXITED).await;
    assert_eq!(exited.data["terminal_id"], terminal.id.as_str());

    let info: TerminalResponse = server
        .http
        .get(server.url(&format!("/terminals/{}", terminal.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.status, TerminalStatus::Exited);

    let resp = server
        .http
        .delete(server.url(&format!("/terminals/{}", terminal.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let deleted = next_event(&mut ws, |e| e.event_type == event_types::TERMINAL_DELETED).await;
    assert_eq!(deleted.data["id"], terminal.id.as_str());

    let resp = server
        .http
        .get(server.url(&format!("/terminals/{}", terminal.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

// =============================================================================
// Signal Tests
// =============================================================================

#[tokio::test]
async fn test_signal_lifecycle_and_delivery() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    subscribe(&mut ws, "signals").await;

    // Emitting while stopped is rejected, not queued.
    let resp = server
        .http
        .post(server.url("/signals/error"))
        .json(&json!({"message": "too early"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let status: SignalStatusResponse = server
        .http
        .post(server.url("/signals/start"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, SignalStatus::Active);

    let resp = server.http.post(server.url("/signals/start")).send().await.unwrap();
    assert_eq!(resp.status(), 409);

    let resp = server
        .http
        .post(server.url("/signals/port"))
        .json(&json!({"port": 3000, "type": "open", "url": "http://localhost:3000"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let signal = next_event(&mut ws, |e| e.event_type == event_types::SIGNAL).await;
    assert_eq!(signal.channel.as_deref(), Some("signals"));
    assert_eq!(signal.data["type"], "port");
    assert_eq!(signal.data["data"]["port"], 3000);
    assert_eq!(signal.data["data"]["type"], "open");

    server
        .http
        .post(server.url("/signals/server-ready"))
        .json(&json!({"port": 8080, "url": "http://localhost:8080"}))
        .send()
        .await
        .unwrap();
    let signal = next_event(&mut ws, |e| e.event_type == event_types::SIGNAL).await;
    assert_eq!(signal.data["type"], "server-ready");

    let resp = server
        .http
        .post(server.url("/signals/port"))
        .json(&json!({"port": 0, "type": "close", "url": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let status: SignalStatusResponse = server
        .http
        .post(server.url("/signals/stop"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, SignalStatus::Stopped);

    // A second start gets a fresh stream.
    let resp = server.http.post(server.url("/signals/start")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    server.stop().await;
}

// =============================================================================
// Watcher Tests
// =============================================================================

#[tokio::test]
async fn test_watcher_publishes_file_changes() {
    let server = TestServer::start().await;
    let dir = TempDir::new().unwrap();

    let resp = server
        .http
        .post(server.url("/watchers"))
        .json(&json!({
            "path": dir.path().to_str().unwrap(),
            "includeContent": true,
            "ignored": ["*.tmp"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let watcher: WatcherResponse = resp.json().await.unwrap();
    assert!(watcher.include_content);
    assert_eq!(watcher.channel, format!("watcher:{}", watcher.id));

    let mut ws = server.connect().await;
    subscribe(&mut ws, &watcher.channel).await;

    tokio::fs::write(dir.path().join("scratch.tmp"), "ignored")
        .await
        .unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), "hello watcher")
        .await
        .unwrap();

    let event = next_event(&mut ws, |e| e.event_type == event_types::FILE_CHANGED).await;
    assert_eq!(event.channel.as_deref(), Some(watcher.channel.as_str()));
    assert_eq!(event.data["watcher_id"], watcher.id.as_str());
    assert!(event.data["path"].as_str().unwrap().ends_with("notes.txt"));
    assert_eq!(event.data["is_dir"], false);

    let resp = server
        .http
        .delete(server.url(&format!("/watchers/{}", watcher.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server
        .http
        .get(server.url(&format!("/watchers/{}", watcher.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_watcher_rejects_bad_paths() {
    let server = TestServer::start().await;
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain.txt");
    std::fs::write(&file, "x").unwrap();

    for path in [
        dir.path().join("missing").to_str().unwrap().to_string(),
        file.to_str().unwrap().to_string(),
        String::new(),
    ] {
        let resp = server
            .http
            .post(server.url("/watchers"))
            .json(&json!({"path": path}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "path {:?}", path);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.code, "VALIDATION_ERROR");
    }

    server.stop().await;
}

// =============================================================================
// WebSocket Protocol Tests
// =============================================================================

#[tokio::test]
async fn test_bad_frames_do_not_close_the_socket() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let err = next_event(&mut ws, |e| e.event_type == event_types::ERROR).await;
    assert!(err.data["message"].as_str().is_some());

    send(&mut ws, json!({"type": "teleport", "data": {}})).await;
    next_event(&mut ws, |e| e.event_type == event_types::ERROR).await;

    send(&mut ws, json!({"type": "ping"})).await;
    next_event(&mut ws, |e| e.event_type == event_types::PONG).await;

    send(&mut ws, json!({"type": "unsubscribe", "data": {"channel": "signals"}})).await;
    let ack = next_event(&mut ws, |e| e.event_type == event_types::UNSUBSCRIBED).await;
    assert_eq!(ack.data["channel"], "signals");

    server.stop().await;
}
