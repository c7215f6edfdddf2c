//! Shared fixtures for transport tests.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use serde_json::Value;
use tokio::sync::mpsc;

use agentlink_core::RelayConfig;

use crate::auth::JwtManager;
use crate::protocol::Envelope;
use crate::registry::{AgentConnection, AgentMetadata};
use crate::relay::AgentRelay;
use crate::storage::RelayDatabase;

use super::build_router;

pub const TEST_SECRET: &[u8] = b"transport-test-secret";

pub async fn test_relay() -> Arc<AgentRelay> {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    let jwt = JwtManager::new(TEST_SECRET, "agentlink-relay", 3600);
    Arc::new(AgentRelay::new(RelayConfig::default(), jwt, db))
}

pub async fn test_app() -> (Router, Arc<AgentRelay>) {
    let relay = test_relay().await;
    (build_router(Arc::clone(&relay)), relay)
}

pub fn access_token(relay: &AgentRelay, user_id: &str) -> String {
    relay
        .gateway()
        .jwt()
        .issue_access_token(user_id)
        .unwrap()
        .0
}

/// Build a request with an optional bearer token and JSON body.
pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Connect an in-process agent for `user_id` with its tool server up.
/// The handshake envelope is already consumed from the returned receiver.
pub async fn connect_agent(
    relay: &AgentRelay,
    user_id: &str,
) -> (Arc<AgentConnection>, mpsc::Receiver<Envelope>) {
    let issued = relay
        .issue_credential(user_id, "Test agent", None, 3600)
        .await
        .unwrap();
    let identity = relay.gateway().authenticate(&issued.token).await.unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let conn = relay.connect(&identity, AgentMetadata::default(), tx).await;
    rx.recv().await.unwrap();

    let status = r#"{"type": "tool_status_update", "payload": {"connected": true, "tools_count": 3}}"#;
    relay.dispatch(&conn, status).await.unwrap();
    (conn, rx)
}
