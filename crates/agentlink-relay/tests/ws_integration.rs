#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests: a real listener driven by a WebSocket client playing
//! the desktop agent.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use agentlink_core::RelayConfig;
use agentlink_relay::AgentRelay;
use agentlink_relay::auth::JwtManager;
use agentlink_relay::error::ToolError;
use agentlink_relay::server::build_router;
use agentlink_relay::storage::RelayDatabase;

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (Arc<AgentRelay>, String) {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    let jwt = JwtManager::new(b"integration-secret", "agentlink-relay", 3600);
    let relay = Arc::new(AgentRelay::new(RelayConfig::default(), jwt, db));
    relay.start().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::clone(&relay));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (relay, format!("ws://{addr}/v1/agent/ws"))
}

async fn issue_token(relay: &AgentRelay, user_id: &str) -> (String, String) {
    let issued = relay
        .issue_credential(user_id, "Integration agent", None, 3600)
        .await
        .unwrap();
    (issued.token, issued.record.id)
}

async fn connect(url: &str, token: &str) -> AgentSocket {
    let (ws, _) = connect_async(format!("{url}?token={token}&version=1.4.0&hostname=rig"))
        .await
        .unwrap();
    ws
}

/// Next text frame as JSON. Control frames are skipped.
async fn next_envelope(ws: &mut AgentSocket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Close code of the next close frame.
async fn next_close_code(ws: &mut AgentSocket) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Close(frame) = msg {
            return frame.map_or(1005, |f| u16::from(f.code));
        }
    }
}

async fn send(ws: &mut AgentSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn wait_for_tool_server(relay: &AgentRelay, user_id: &str) {
    for _ in 0..100 {
        if relay.get_status(user_id).await.mcp_connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tool server never reported connected");
}

#[tokio::test]
async fn bad_credentials_close_with_failure_code() {
    let (relay, url) = spawn_relay().await;

    let mut ws = connect(&url, "garbage").await;
    assert_eq!(next_close_code(&mut ws).await, 4002);

    let (token, id) = issue_token(&relay, "u1").await;
    relay.revoke_credential("u1", &id).await.unwrap();
    let mut ws = connect(&url, &token).await;
    assert_eq!(next_close_code(&mut ws).await, 4003);

    assert_eq!(relay.registry().connection_count().await, 0);
    relay.stop().await;
}

#[tokio::test]
async fn handshake_and_tool_round_trip() {
    let (relay, url) = spawn_relay().await;
    let (token, _) = issue_token(&relay, "u1").await;
    let mut ws = connect(&url, &token).await;

    let ack = next_envelope(&mut ws).await;
    assert_eq!(ack["type"], "connect");
    assert_eq!(ack["payload"]["user_id"], "u1");
    assert_eq!(ack["payload"]["heartbeat_interval_secs"], 30);

    send(
        &mut ws,
        json!({"type": "tool_status_update", "payload": {
            "connected": true, "project_name": "Demo", "tools_count": 12
        }}),
    )
    .await;
    wait_for_tool_server(&relay, "u1").await;

    let status = relay.get_status("u1").await;
    assert_eq!(status.agent_version.as_deref(), Some("1.4.0"));
    assert_eq!(status.agent_hostname.as_deref(), Some("rig"));

    let caller = Arc::clone(&relay);
    let call = tokio::spawn(async move {
        let mut args = Map::new();
        args.insert("name".into(), json!("Cube_1"));
        caller.execute_tool("u1", "spawn_actor", args, None).await
    });

    let request = next_envelope(&mut ws).await;
    assert_eq!(request["type"], "tool_request");
    assert_eq!(request["payload"]["tool_name"], "spawn_actor");
    assert_eq!(request["payload"]["arguments"]["name"], "Cube_1");
    send(
        &mut ws,
        json!({
            "type": "tool_response",
            "correlation_id": request["correlation_id"],
            "payload": {"result": {"spawned": "Cube_1"}}
        }),
    )
    .await;

    assert_eq!(call.await.unwrap().unwrap(), json!({"spawned": "Cube_1"}));
    assert_eq!(relay.get_status("u1").await.commands_executed, 1);
    relay.stop().await;
}

#[tokio::test]
async fn invalid_frames_get_error_reply_and_session_survives() {
    let (relay, url) = spawn_relay().await;
    let (token, _) = issue_token(&relay, "u1").await;
    let mut ws = connect(&url, &token).await;
    next_envelope(&mut ws).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = next_envelope(&mut ws).await;
    assert_eq!(reply["type"], "error");

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let reply = next_envelope(&mut ws).await;
    assert_eq!(reply["type"], "error");

    assert!(relay.get_status("u1").await.connected);
    relay.stop().await;
}

#[tokio::test]
async fn second_connection_replaces_first() {
    let (relay, url) = spawn_relay().await;
    let (token, _) = issue_token(&relay, "u1").await;

    let mut first = connect(&url, &token).await;
    next_envelope(&mut first).await;
    let mut second = connect(&url, &token).await;
    let ack = next_envelope(&mut second).await;

    let notice = next_envelope(&mut first).await;
    assert_eq!(notice["type"], "disconnect");
    assert_eq!(notice["payload"]["reason"], "New connection established");
    assert_eq!(next_close_code(&mut first).await, 4000);

    let status = relay.get_status("u1").await;
    assert_eq!(
        status.connection_id.as_deref(),
        ack["payload"]["connection_id"].as_str()
    );
    relay.stop().await;
}

#[tokio::test]
async fn dropped_socket_fails_pending_call() {
    let (relay, url) = spawn_relay().await;
    let (token, _) = issue_token(&relay, "u1").await;
    let mut ws = connect(&url, &token).await;
    next_envelope(&mut ws).await;
    send(
        &mut ws,
        json!({"type": "tool_status_update", "payload": {"connected": true}}),
    )
    .await;
    wait_for_tool_server(&relay, "u1").await;

    let caller = Arc::clone(&relay);
    let call = tokio::spawn(async move {
        caller
            .execute_tool("u1", "bake_lighting", Map::new(), None)
            .await
    });
    next_envelope(&mut ws).await;
    drop(ws);

    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ToolError::ConnectionLost);
    assert!(!relay.get_status("u1").await.connected);
    relay.stop().await;
}

#[tokio::test]
async fn revocation_closes_live_socket() {
    let (relay, url) = spawn_relay().await;
    let (token, id) = issue_token(&relay, "u1").await;
    let mut ws = connect(&url, &token).await;
    next_envelope(&mut ws).await;

    assert!(relay.revoke_credential("u1", &id).await.unwrap());

    let notice = next_envelope(&mut ws).await;
    assert_eq!(notice["type"], "disconnect");
    assert_eq!(next_close_code(&mut ws).await, 4003);
    relay.stop().await;
}
