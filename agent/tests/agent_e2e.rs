//! End-to-end tests for the agent binary.
//!
//! These spawn the real `sentinel-agent` built by cargo, stand up a fake
//! fleet server on a local WebSocket, and exercise the full loop: auth,
//! inventory, terminal session traffic, command validation, and
//! shutdown. Terminal sessions need a real pty, so the suite is
//! Unix-only.

#![cfg(unix)]

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Kills the agent process on drop so a failing test never leaks it.
struct AgentProcess(Child);

impl Drop for AgentProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn write_config(data_dir: &std::path::Path, server_url: &str) {
    let config = json!({
        "agent_id": "00000000-0000-0000-0000-000000000001",
        "server_url": server_url,
        "enrollment_token": "TK",
        "device_id": null,
        "enrolled": false,
        "heartbeat_interval_secs": 1,
        "metrics_interval_secs": 3600,
        "update_poll_interval_secs": 3600,
    });
    std::fs::write(
        data_dir.join("config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
}

fn spawn_agent(data_dir: &std::path::Path) -> AgentProcess {
    let child = Command::new(env!("CARGO_BIN_EXE_sentinel-agent"))
        .env("SENTINEL_DATA_DIR", data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("agent binary spawns");
    AgentProcess(child)
}

struct Server {
    ws: WebSocketStream<TcpStream>,
}

impl Server {
    /// Accept one agent connection and complete the auth handshake.
    async fn accept(listener: TcpListener) -> Self {
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(15), listener.accept())
            .await
            .expect("agent connects")
            .unwrap();
        let mut ws = accept_async(tcp).await.unwrap();

        let auth = next_json(&mut ws).await;
        assert_eq!(auth["type"], "auth");
        assert_eq!(
            auth["payload"]["agent_id"],
            "00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(auth["payload"]["enrollment_token"], "TK");

        let response = json!({
            "type": "auth_response",
            "payload": {"accepted": true, "device_id": "D1"},
        });
        ws.send(Message::text(response.to_string())).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, frame: Value) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    /// Next frame of the given type, skipping heartbeats and metrics.
    async fn expect(&mut self, kind: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let frame = tokio::time::timeout_at(deadline, next_json(&mut self.ws))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for '{kind}' frame"));
            if frame["type"] == kind {
                return frame;
            }
            if frame["type"] == "heartbeat" {
                self.send(json!({"type": "heartbeat_ack", "payload": {}}))
                    .await;
            }
        }
    }
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).unwrap();
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended unexpectedly: {other:?}"),
        }
    }
}

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64_decode(data: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(data).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn full_agent_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    write_config(tmp.path(), &url);

    let _agent = spawn_agent(tmp.path());
    let mut server = Server::accept(listener).await;

    // Inventory arrives right after a successful connect.
    let inventory = server.expect("agent_info").await;
    assert_eq!(
        inventory["payload"]["agent_id"],
        "00000000-0000-0000-0000-000000000001"
    );
    assert!(inventory["payload"]["version"].as_str().is_some());

    // The liveness file exists once the agent is up.
    assert!(tmp.path().join("update").join("agent-info.json").exists());

    // A heartbeat shows up within the configured 1 s interval.
    server.expect("heartbeat").await;

    // Open a terminal and run a marker command through the pty.
    server
        .send(json!({
            "type": "start_terminal",
            "payload": {"session_id": "t1", "shell": "/bin/sh", "cols": 80, "rows": 24},
        }))
        .await;
    let ack = server.expect("session_open_ack").await;
    assert_eq!(ack["payload"]["session_id"], "t1");
    assert_eq!(ack["payload"]["kind"], "terminal");

    server
        .send(json!({
            "type": "terminal_input",
            "payload": {"session_id": "t1", "data": b64(b"echo e2e-$((40+2))\n")},
        }))
        .await;

    let mut terminal_output = Vec::new();
    loop {
        let output = server.expect("session_output").await;
        assert_eq!(output["payload"]["session_id"], "t1");
        assert_eq!(output["payload"]["subtype"], "terminal_output");
        terminal_output.extend(b64_decode(output["payload"]["data"].as_str().unwrap()));
        if String::from_utf8_lossy(&terminal_output).contains("e2e-42") {
            break;
        }
    }

    // A file-browser session interleaves with the live terminal.
    std::fs::write(tmp.path().join("visible.txt"), b"data").unwrap();
    server
        .send(json!({
            "type": "list_files",
            "payload": {"session_id": "f1", "path": tmp.path().to_str().unwrap()},
        }))
        .await;
    let ack = server.expect("session_open_ack").await;
    assert_eq!(ack["payload"]["kind"], "file_browser");
    let listing = server.expect("session_output").await;
    assert_eq!(listing["payload"]["subtype"], "file_list");
    let names: Vec<&str> = listing["payload"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert!(names.contains(&"visible.txt"));

    // A denied command returns a structured result without executing.
    server
        .send(json!({
            "type": "execute_command",
            "payload": {"command_id": "c1", "command": "rm -rf /"},
        }))
        .await;
    let result = server.expect("command_result").await;
    assert_eq!(result["payload"]["command_id"], "c1");
    assert_eq!(result["payload"]["exit_code"], -1);
    assert_eq!(result["payload"]["error"], "validation_denied");

    // An allowed command executes and reports stdout.
    server
        .send(json!({
            "type": "execute_command",
            "payload": {"command_id": "c2", "command": "echo via-agent"},
        }))
        .await;
    let result = server.expect("command_result").await;
    assert_eq!(result["payload"]["command_id"], "c2");
    assert_eq!(result["payload"]["exit_code"], 0);
    assert!(result["payload"]["stdout"]
        .as_str()
        .unwrap()
        .contains("via-agent"));

    // Closing the terminal produces a final session_closed.
    server
        .send(json!({
            "type": "close_terminal",
            "payload": {"session_id": "t1"},
        }))
        .await;
    let closed = server.expect("session_closed").await;
    assert_eq!(closed["payload"]["session_id"], "t1");
    assert_eq!(closed["payload"]["reason"], "closed_by_server");

    // The same session id can be reused after close: no state leaks.
    server
        .send(json!({
            "type": "start_terminal",
            "payload": {"session_id": "t1", "shell": "/bin/sh"},
        }))
        .await;
    let ack = server.expect("session_open_ack").await;
    assert_eq!(ack["payload"]["session_id"], "t1");
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_output_is_ordered() {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    write_config(tmp.path(), &url);

    let _agent = spawn_agent(tmp.path());
    let mut server = Server::accept(listener).await;
    server.expect("agent_info").await;

    server
        .send(json!({
            "type": "start_terminal",
            "payload": {"session_id": "seq", "shell": "/bin/sh"},
        }))
        .await;
    server.expect("session_open_ack").await;

    // One hundred numbered lines; they must arrive in produce order.
    server
        .send(json!({
            "type": "terminal_input",
            "payload": {"session_id": "seq", "data": b64(b"for i in $(seq 1 100); do echo line-$i; done\n")},
        }))
        .await;

    let mut collected = Vec::new();
    loop {
        let output = server.expect("session_output").await;
        collected.extend(b64_decode(output["payload"]["data"].as_str().unwrap()));
        if String::from_utf8_lossy(&collected).contains("line-100") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&collected);
    let mut last_position = 0usize;
    for n in [1usize, 25, 50, 75, 100] {
        let needle = format!("line-{n}\r");
        let position = text.find(&needle).unwrap_or_else(|| {
            panic!("line-{n} missing from terminal output")
        });
        assert!(position >= last_position, "line-{n} arrived out of order");
        last_position = position;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_frame_stops_the_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    write_config(tmp.path(), &url);

    let mut agent = spawn_agent(tmp.path());
    let mut server = Server::accept(listener).await;
    server.expect("agent_info").await;

    server
        .send(json!({"type": "shutdown", "payload": {}}))
        .await;

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(Some(status)) = agent.0.try_wait() {
            assert!(status.success(), "agent should exit cleanly, got {status}");
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "agent did not exit after shutdown frame"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_enrollment_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    write_config(tmp.path(), &url);

    let mut agent = spawn_agent(tmp.path());

    let (tcp, _) = tokio::time::timeout(Duration::from_secs(15), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut ws = accept_async(tcp).await.unwrap();
    let auth = next_json(&mut ws).await;
    assert_eq!(auth["type"], "auth");
    ws.send(Message::text(
        json!({
            "type": "auth_response",
            "payload": {"accepted": false, "error": "unknown enrollment token"},
        })
        .to_string(),
    ))
    .await
    .unwrap();

    // The agent must stop, not loop on reconnect.
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(Some(_)) = agent.0.try_wait() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "agent kept running after enrollment denial"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
