//! A single live agent connection and the requests waiting on it.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

use agentlink_core::db::unix_timestamp;

use crate::protocol::Envelope;

/// What the agent reported about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentMetadata {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub hostname: Option<String>,
}

/// State of the agent's own link to the editor tool server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolServerStatus {
    pub connected: bool,
    pub host: Option<String>,
    pub project_name: Option<String>,
    pub engine_version: Option<String>,
    pub tools_count: u32,
    pub connected_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    Replaced,
    HeartbeatTimeout,
    CredentialRevoked,
    ServerShutdown,
    Transport(String),
}

impl DisconnectReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Replaced => "replaced",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::CredentialRevoked => "credential_revoked",
            Self::ServerShutdown => "server_shutdown",
            Self::Transport(_) => "transport_error",
        }
    }

    /// Human-readable text sent to the agent in the `disconnect` envelope.
    pub fn message(&self) -> String {
        match self {
            Self::ClientClosed => "Client disconnected".to_string(),
            Self::Replaced => "New connection established".to_string(),
            Self::HeartbeatTimeout => "Heartbeat timeout".to_string(),
            Self::CredentialRevoked => "Token revoked".to_string(),
            Self::ServerShutdown => "Relay shutting down".to_string(),
            Self::Transport(e) => format!("Transport error: {e}"),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pending request was resolved by someone other than its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOutcome {
    /// The agent answered: `Ok(result)` or `Err(agent error text)`.
    Response(Result<Value, String>),
    ConnectionLost,
    /// Swept after its deadline passed.
    Expired,
}

struct PendingRequest {
    tool_name: String,
    deadline: Instant,
    tx: oneshot::Sender<PendingOutcome>,
}

struct ConnectionInner {
    status: ConnectionStatus,
    metadata: AgentMetadata,
    tool_server: ToolServerStatus,
    commands_executed: u64,
    last_command_at: Option<i64>,
    last_activity: Instant,
    last_activity_at: i64,
    pending: HashMap<String, PendingRequest>,
}

/// Point-in-time copy of a connection, safe to serialize without locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub user_id: String,
    pub credential_id: String,
    pub connected_at: i64,
    pub status: ConnectionStatus,
    pub metadata: AgentMetadata,
    pub tool_server: ToolServerStatus,
    pub commands_executed: u64,
    pub last_command_at: Option<i64>,
    pub last_heartbeat_at: i64,
    pub pending_requests: usize,
}

/// Holds an active socket connection to a desktop agent.
///
/// The socket itself is owned by the transport task; this struct only holds
/// the outbound queue feeding that task and the close signal. Status, nested
/// tool-server state and pending requests share one lock so that teardown
/// clears all of them in a single critical section.
pub struct AgentConnection {
    pub connection_id: String,
    pub user_id: String,
    pub credential_id: String,
    pub connected_at: i64,
    outbound: mpsc::Sender<Envelope>,
    close_tx: watch::Sender<Option<DisconnectReason>>,
    inner: Mutex<ConnectionInner>,
}

impl AgentConnection {
    pub fn new(
        user_id: String,
        credential_id: String,
        metadata: AgentMetadata,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            user_id,
            credential_id,
            connected_at: unix_timestamp(),
            outbound,
            close_tx,
            inner: Mutex::new(ConnectionInner {
                status: ConnectionStatus::Connected,
                metadata,
                tool_server: ToolServerStatus::default(),
                commands_executed: 0,
                last_command_at: None,
                last_activity: Instant::now(),
                last_activity_at: unix_timestamp(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Queue a frame for the agent, waiting for queue capacity.
    pub async fn send(&self, envelope: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.outbound.send(envelope).await
    }

    /// Queue a frame without waiting. Returns `false` if the queue is full
    /// or the transport is gone.
    pub fn try_send(&self, envelope: Envelope) -> bool {
        self.outbound.try_send(envelope).is_ok()
    }

    /// Receiver that yields once the connection is torn down.
    pub fn closed(&self) -> watch::Receiver<Option<DisconnectReason>> {
        self.close_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.status == ConnectionStatus::Connected
    }

    /// Register a pending request and return a receiver for its resolution.
    ///
    /// Returns `None` once the connection has been torn down, so a caller
    /// racing with teardown can never leave an entry behind.
    pub async fn register_pending(
        &self,
        correlation_id: String,
        tool_name: &str,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<PendingOutcome>> {
        let mut inner = self.inner.lock().await;
        if inner.status != ConnectionStatus::Connected {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            correlation_id,
            PendingRequest {
                tool_name: tool_name.to_string(),
                deadline,
                tx,
            },
        );
        Some(rx)
    }

    /// Resolve a pending request. Returns `false` when nothing was waiting
    /// (unknown id, already timed out, or already resolved).
    pub async fn complete_pending(&self, correlation_id: &str, outcome: PendingOutcome) -> bool {
        let entry = self.inner.lock().await.pending.remove(correlation_id);
        match entry {
            Some(pending) => pending.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a pending request without resolving it. Returns `true` if the
    /// caller removed it, i.e. nobody else resolved it first.
    pub async fn take_pending(&self, correlation_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .pending
            .remove(correlation_id)
            .is_some()
    }

    /// Resolve every pending request whose deadline is before `now`.
    pub async fn expire_overdue(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().await;
        let overdue: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &overdue {
            if let Some(pending) = inner.pending.remove(id) {
                tracing::debug!(
                    correlation_id = %id,
                    tool_name = %pending.tool_name,
                    "Expiring overdue tool request"
                );
                let _ = pending.tx.send(PendingOutcome::Expired);
            }
        }
        overdue.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Tear the connection down: mark it disconnected, clear the nested
    /// tool-server status, fail every pending request with
    /// [`PendingOutcome::ConnectionLost`], send a best-effort `disconnect`
    /// frame and signal the transport to close the socket.
    ///
    /// Returns `false` if it was already torn down.
    pub async fn shutdown(&self, reason: DisconnectReason) -> bool {
        let failed = {
            let mut inner = self.inner.lock().await;
            if inner.status == ConnectionStatus::Disconnected {
                return false;
            }
            inner.status = ConnectionStatus::Disconnected;
            inner.tool_server = ToolServerStatus::default();
            let pending: Vec<PendingRequest> = inner.pending.drain().map(|(_, p)| p).collect();
            let failed = pending.len();
            for p in pending {
                let _ = p.tx.send(PendingOutcome::ConnectionLost);
            }
            failed
        };

        if failed > 0 {
            tracing::info!(
                connection_id = %self.connection_id,
                user_id = %self.user_id,
                failed,
                "Failed pending tool requests on teardown"
            );
        }

        let _ = self.try_send(Envelope::disconnect(&reason.message()));
        self.close_tx.send_replace(Some(reason));
        true
    }

    /// Apply a nested tool-server status. Ignored once disconnected.
    pub async fn set_tool_server(&self, status: ToolServerStatus) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.status != ConnectionStatus::Connected {
            return false;
        }
        inner.tool_server = status;
        true
    }

    pub async fn tool_server_connected(&self) -> bool {
        self.inner.lock().await.tool_server.connected
    }

    pub async fn metadata(&self) -> AgentMetadata {
        self.inner.lock().await.metadata.clone()
    }

    pub async fn set_metadata(&self, metadata: AgentMetadata) {
        self.inner.lock().await.metadata = metadata;
    }

    /// Count a successfully executed command; returns its timestamp.
    pub async fn record_command(&self) -> i64 {
        let now = unix_timestamp();
        let mut inner = self.inner.lock().await;
        inner.commands_executed += 1;
        inner.last_command_at = Some(now);
        now
    }

    /// Note inbound traffic from the agent.
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();
        inner.last_activity_at = unix_timestamp();
    }

    pub async fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().await.last_activity)
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock().await;
        ConnectionSnapshot {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            credential_id: self.credential_id.clone(),
            connected_at: self.connected_at,
            status: inner.status,
            metadata: inner.metadata.clone(),
            tool_server: inner.tool_server.clone(),
            commands_executed: inner.commands_executed,
            last_command_at: inner.last_command_at,
            last_heartbeat_at: inner.last_activity_at,
            pending_requests: inner.pending.len(),
        }
    }
}

impl fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConnection")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("credential_id", &self.credential_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::EnvelopeType;

    fn test_conn() -> (AgentConnection, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = AgentConnection::new("u1".into(), "cred-1".into(), AgentMetadata::default(), tx);
        (conn, rx)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn pending_request_lifecycle() {
        let (conn, _rx) = test_conn();

        let response_rx = conn
            .register_pending("req-1".into(), "spawn_actor", far_deadline())
            .await
            .unwrap();

        let outcome = PendingOutcome::Response(Ok(json!({"ok": true})));
        assert!(conn.complete_pending("req-1", outcome.clone()).await);

        assert_eq!(response_rx.await.unwrap(), outcome);
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn complete_unknown_pending_returns_false() {
        let (conn, _rx) = test_conn();
        let outcome = PendingOutcome::Response(Ok(json!(null)));
        assert!(!conn.complete_pending("nonexistent", outcome).await);
    }

    #[tokio::test]
    async fn second_resolution_is_ignored() {
        let (conn, _rx) = test_conn();
        let _rx1 = conn
            .register_pending("req-1".into(), "t", far_deadline())
            .await
            .unwrap();

        assert!(conn.take_pending("req-1").await);
        assert!(!conn.take_pending("req-1").await);
        assert!(
            !conn
                .complete_pending("req-1", PendingOutcome::Response(Ok(json!(1))))
                .await
        );
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_clears_tool_server() {
        let (conn, mut rx) = test_conn();
        let mut closed = conn.closed();
        conn.set_tool_server(ToolServerStatus {
            connected: true,
            tools_count: 12,
            ..Default::default()
        })
        .await;
        let r1 = conn
            .register_pending("a".into(), "t", far_deadline())
            .await
            .unwrap();
        let r2 = conn
            .register_pending("b".into(), "t", far_deadline())
            .await
            .unwrap();

        assert!(conn.shutdown(DisconnectReason::HeartbeatTimeout).await);

        assert_eq!(r1.await.unwrap(), PendingOutcome::ConnectionLost);
        assert_eq!(r2.await.unwrap(), PendingOutcome::ConnectionLost);

        let snap = conn.snapshot().await;
        assert_eq!(snap.status, ConnectionStatus::Disconnected);
        assert!(!snap.tool_server.connected);
        assert_eq!(snap.tool_server.tools_count, 0);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, EnvelopeType::Disconnect);
        assert_eq!(frame.payload["reason"], "Heartbeat timeout");

        closed.changed().await.unwrap();
        assert_eq!(
            *closed.borrow(),
            Some(DisconnectReason::HeartbeatTimeout)
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_new_pending() {
        let (conn, _rx) = test_conn();
        assert!(conn.shutdown(DisconnectReason::ClientClosed).await);
        assert!(!conn.shutdown(DisconnectReason::Replaced).await);

        assert!(
            conn.register_pending("late".into(), "t", far_deadline())
                .await
                .is_none()
        );
        assert!(
            !conn
                .set_tool_server(ToolServerStatus {
                    connected: true,
                    ..Default::default()
                })
                .await
        );
        assert!(!conn.tool_server_connected().await);
    }

    #[tokio::test]
    async fn expire_overdue_only_touches_past_deadlines() {
        let (conn, _rx) = test_conn();
        let past = conn
            .register_pending("old".into(), "t", Instant::now())
            .await
            .unwrap();
        let _future = conn
            .register_pending("new".into(), "t", far_deadline())
            .await
            .unwrap();

        assert_eq!(conn.expire_overdue(Instant::now()).await, 1);
        assert_eq!(past.await.unwrap(), PendingOutcome::Expired);
        assert_eq!(conn.pending_count().await, 1);
    }

    #[tokio::test]
    async fn record_command_updates_counters() {
        let (conn, _rx) = test_conn();
        conn.record_command().await;
        let at = conn.record_command().await;

        let snap = conn.snapshot().await;
        assert_eq!(snap.commands_executed, 2);
        assert_eq!(snap.last_command_at, Some(at));
    }
}
