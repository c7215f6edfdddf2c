//! WebSocket endpoint for desktop agents.
//!
//! One task per socket. It authenticates, installs the connection, then
//! multiplexes inbound frames, queued outbound envelopes and the
//! connection's close signal until one side goes away.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::AppState;
use crate::protocol::{Envelope, EnvelopeError};
use crate::registry::{AgentConnection, AgentMetadata, DisconnectReason};
use crate::relay::{AgentRelay, Dispatch};

/// A peer that stops reading cannot hold the session loop past this.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct AgentSocketQuery {
    #[serde(default)]
    pub token: String,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub hostname: Option<String>,
}

/// `GET /v1/agent/ws`
pub async fn agent_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<AgentSocketQuery>,
    State(state): State<AppState>,
) -> Response {
    let origin = client_origin(&headers);
    ws.on_upgrade(move |socket| serve_agent(state.relay, socket, query, origin))
}

/// Client address as reported by a fronting proxy.
pub fn client_origin(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(ToString::to_string)
}

/// Close code sent when the relay ends a live session.
pub const fn close_code(reason: &DisconnectReason) -> u16 {
    match reason {
        DisconnectReason::ClientClosed => 1000,
        DisconnectReason::ServerShutdown => 1001,
        DisconnectReason::Transport(_) => 1011,
        DisconnectReason::Replaced => 4000,
        DisconnectReason::CredentialRevoked => 4003,
        DisconnectReason::HeartbeatTimeout => 4008,
    }
}

#[instrument(skip_all, fields(user_id, connection_id))]
async fn serve_agent(
    relay: Arc<AgentRelay>,
    mut socket: WebSocket,
    query: AgentSocketQuery,
    origin: Option<String>,
) {
    let identity = match relay.gateway().authenticate(&query.token).await {
        Ok(identity) => identity,
        Err(failure) => {
            warn!(reason = %failure, origin = ?origin, "Agent authentication failed");
            let frame = CloseFrame {
                code: failure.close_code(),
                reason: failure.to_string().into(),
            };
            let _ = bounded_write(WRITE_TIMEOUT, socket.send(Message::Close(Some(frame)))).await;
            return;
        }
    };
    relay
        .gateway()
        .mark_used(&identity.credential_id, origin.as_deref())
        .await;

    let metadata = AgentMetadata {
        version: query.version,
        platform: query.platform,
        hostname: query.hostname,
    };
    let (tx, mut outbound) = mpsc::channel(relay.config().relay.outbound_queue.max(1));
    let conn = relay.connect(&identity, metadata, tx).await;

    let span = tracing::Span::current();
    span.record("user_id", identity.user_id.as_str());
    span.record("connection_id", conn.connection_id.as_str());
    info!(origin = ?origin, "Agent connected");

    let mut closed = conn.closed();
    let reason = session(&relay, &conn, &mut socket, &mut outbound, &mut closed).await;

    relay.disconnect(&conn, reason.clone()).await;

    // Frames queued before teardown, including the disconnect notice.
    while let Ok(envelope) = outbound.try_recv() {
        if send_envelope(&mut socket, &envelope).await.is_err() {
            break;
        }
    }
    let frame = CloseFrame {
        code: close_code(&reason),
        reason: reason.message().into(),
    };
    let _ = bounded_write(WRITE_TIMEOUT, socket.send(Message::Close(Some(frame)))).await;

    info!(reason = %reason, "Agent disconnected");
}

async fn session(
    relay: &AgentRelay,
    conn: &AgentConnection,
    socket: &mut WebSocket,
    outbound: &mut mpsc::Receiver<Envelope>,
    closed: &mut watch::Receiver<Option<DisconnectReason>>,
) -> DisconnectReason {
    if let Some(reason) = closed.borrow_and_update().clone() {
        return reason;
    }

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match relay.dispatch(conn, text.as_str()).await {
                        Ok(Dispatch::Continue) => {}
                        Ok(Dispatch::Close) => return DisconnectReason::ClientClosed,
                        Err(e) => {
                            if let Err(reason) = reject(socket, conn, &e).await {
                                return reason;
                            }
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    conn.touch().await;
                    if let Err(reason) = reject(socket, conn, &EnvelopeError::Binary).await {
                        return reason;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch().await,
                Some(Ok(Message::Close(_))) | None => return DisconnectReason::ClientClosed,
                Some(Err(e)) => return DisconnectReason::Transport(e.to_string()),
            },
            Some(envelope) = outbound.recv() => {
                if let Err(e) = send_envelope(socket, &envelope).await {
                    return DisconnectReason::Transport(e);
                }
            }
            changed = closed.changed() => {
                let reason = closed.borrow_and_update().clone();
                return match (changed, reason) {
                    (Ok(()), Some(reason)) => reason,
                    _ => DisconnectReason::ServerShutdown,
                };
            }
        }
    }
}

async fn reject(
    socket: &mut WebSocket,
    conn: &AgentConnection,
    error: &EnvelopeError,
) -> Result<(), DisconnectReason> {
    warn!(connection_id = %conn.connection_id, error = %error, "Invalid agent message");
    send_envelope(socket, &Envelope::error(&error.to_string()))
        .await
        .map_err(DisconnectReason::Transport)
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), String> {
    let text = envelope.encode().map_err(|e| e.to_string())?;
    debug!(kind = envelope.kind.as_str(), "Sending envelope");
    bounded_write(WRITE_TIMEOUT, socket.send(Message::Text(text.into()))).await
}

async fn bounded_write(
    limit: Duration,
    write: impl Future<Output = Result<(), axum::Error>>,
) -> Result<(), String> {
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("write stalled for {}s", limit.as_secs())),
    }
}
