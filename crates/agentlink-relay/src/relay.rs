//! The relay service object: owns every component and their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentlink_core::RelayConfig;
use agentlink_core::db::unix_timestamp;

use crate::auth::{AgentIdentity, AuthGateway, JwtManager};
use crate::breaker::CircuitBreakers;
use crate::error::ToolError;
use crate::history::HistoryRecorder;
use crate::protocol::payloads::{self, AgentInfoPayload, HeartbeatPayload, ToolStatusPayload};
use crate::protocol::{Envelope, EnvelopeError, EnvelopeType};
use crate::registry::{
    AgentConnection, AgentMetadata, ConnectionRegistry, DisconnectReason, HeartbeatMonitor,
    ToolServerStatus,
};
use crate::router::ToolRouter;
use crate::status::{AgentStatus, StatusReporter};
use crate::storage::{AgentCredential, DatabaseError, NewCredential, RelayDatabase};

/// Characters of an issued credential kept for display.
const TOKEN_PREFIX_LEN: usize = 12;

/// What the transport should do after a frame was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The agent asked to disconnect.
    Close,
}

/// A freshly issued agent credential. `token` is only ever shown once.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub record: AgentCredential,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Failed to sign credential: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Agent relay service. Construct once, `start` it, hand clones of the
/// `Arc` to whatever serves the external interfaces, and `stop` it on
/// shutdown.
pub struct AgentRelay {
    config: RelayConfig,
    db: RelayDatabase,
    registry: Arc<ConnectionRegistry>,
    router: ToolRouter,
    status: StatusReporter,
    gateway: AuthGateway,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRelay {
    pub fn new(config: RelayConfig, jwt: JwtManager, db: RelayDatabase) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let breakers = Arc::new(CircuitBreakers::new(&config.breaker));
        let router = ToolRouter::new(Arc::clone(&registry), Arc::clone(&breakers), &config.relay);
        let status = StatusReporter::new(Arc::clone(&registry), breakers);
        let gateway = AuthGateway::new(jwt, Arc::new(db.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            db,
            registry,
            router,
            status,
            gateway,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub const fn db(&self) -> &RelayDatabase {
        &self.db
    }

    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub const fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    /// Spawn the heartbeat monitor and the history recorder.
    pub async fn start(&self) {
        match self.db.close_stale_connections().await {
            Ok(0) => {}
            Ok(n) => info!(closed = n, "Closed connection rows left by previous run"),
            Err(e) => warn!(error = %e, "Failed to close stale connection rows"),
        }

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.registry),
            self.config.relay.heartbeat_interval(),
            self.config.relay.silence_limit(),
        );
        let recorder = HistoryRecorder::new(self.db.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(recorder.spawn(self.registry.subscribe(), self.shutdown_tx.subscribe()));
        tasks.push(monitor.spawn(self.shutdown_tx.subscribe()));

        info!(
            heartbeat_interval_secs = self.config.relay.heartbeat_interval_secs,
            silence_limit_secs = self.config.relay.silence_limit().as_secs(),
            "Agent relay started"
        );
    }

    /// Close every connection, then stop background tasks.
    pub async fn stop(&self) {
        let closed = self.registry.close_all(DisconnectReason::ServerShutdown).await;
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task ended abnormally");
            }
        }
        info!(closed, "Agent relay stopped");
    }

    /// Install an authenticated agent and queue its handshake reply.
    ///
    /// If the credential stopped being valid since `identity` was issued the
    /// returned connection is already closed with `CredentialRevoked`.
    pub async fn connect(
        &self,
        identity: &AgentIdentity,
        metadata: AgentMetadata,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<AgentConnection> {
        let conn = self
            .registry
            .install(
                &identity.user_id,
                &identity.credential_id,
                metadata,
                outbound,
            )
            .await;

        // A revocation that landed between authentication and install found
        // nothing in the registry to close; catch it here instead.
        if !self.gateway.still_valid(identity).await {
            warn!(
                user_id = %identity.user_id,
                credential_id = %identity.credential_id,
                "Credential revoked during handshake"
            );
            self.disconnect(&conn, DisconnectReason::CredentialRevoked)
                .await;
            return conn;
        }

        conn.try_send(Envelope::connect_ack(
            &conn.connection_id,
            &conn.user_id,
            self.config.relay.heartbeat_interval_secs,
        ));
        conn
    }

    /// Remove `conn` if it is still installed.
    pub async fn disconnect(&self, conn: &AgentConnection, reason: DisconnectReason) {
        self.registry
            .remove_connection(&conn.user_id, &conn.connection_id, reason)
            .await;
    }

    /// Handle one inbound text frame from an agent.
    ///
    /// Any frame counts as activity, even one that is then rejected.
    pub async fn dispatch(
        &self,
        conn: &AgentConnection,
        text: &str,
    ) -> Result<Dispatch, EnvelopeError> {
        conn.touch().await;
        let envelope = Envelope::parse(text)?;

        match envelope.kind {
            EnvelopeType::Heartbeat => {
                let beat: HeartbeatPayload = decode(envelope.payload)?;
                if let Some(connected) = beat.tool_server_connected() {
                    self.apply_heartbeat_status(conn, connected).await;
                }
            }
            EnvelopeType::Connect => {
                let info: AgentInfoPayload = decode(envelope.payload)?;
                let merged = info.apply_to(&conn.metadata().await);
                self.registry
                    .update_agent_info(&conn.user_id, &conn.connection_id, merged)
                    .await;
            }
            EnvelopeType::ToolStatusUpdate => {
                let update: ToolStatusPayload = decode(envelope.payload)?;
                let status = update.into_status(unix_timestamp());
                info!(
                    user_id = %conn.user_id,
                    connection_id = %conn.connection_id,
                    mcp_connected = status.connected,
                    tools_count = status.tools_count,
                    "Tool server status update"
                );
                self.registry
                    .update_tool_server_status(&conn.user_id, &conn.connection_id, status)
                    .await;
            }
            EnvelopeType::ToolResponse => {
                let correlation_id = envelope.correlation_id.unwrap_or_default();
                let reply = payloads::tool_reply(&envelope.payload);
                self.router.resolve(conn, &correlation_id, reply).await;
            }
            EnvelopeType::Error => {
                let message = payloads::error_message(&envelope.payload);
                match envelope.correlation_id {
                    Some(correlation_id) => {
                        self.router.resolve(conn, &correlation_id, Err(message)).await;
                    }
                    None => warn!(
                        user_id = %conn.user_id,
                        connection_id = %conn.connection_id,
                        error = %message,
                        "Agent reported error"
                    ),
                }
            }
            EnvelopeType::Disconnect => {
                debug!(connection_id = %conn.connection_id, "Agent requested disconnect");
                return Ok(Dispatch::Close);
            }
            EnvelopeType::ToolRequest => {
                return Err(EnvelopeError::Unexpected(EnvelopeType::ToolRequest.as_str()));
            }
        }

        Ok(Dispatch::Continue)
    }

    /// Flip the tool-server flag from a heartbeat, only when it changed.
    /// Details from an earlier `ToolStatusUpdate` survive a repeated "connected".
    async fn apply_heartbeat_status(&self, conn: &AgentConnection, connected: bool) {
        if conn.tool_server_connected().await == connected {
            return;
        }
        let status = if connected {
            ToolServerStatus {
                connected: true,
                connected_at: Some(unix_timestamp()),
                ..Default::default()
            }
        } else {
            ToolServerStatus::default()
        };
        info!(
            user_id = %conn.user_id,
            connection_id = %conn.connection_id,
            mcp_connected = connected,
            "Tool server status changed via heartbeat"
        );
        self.registry
            .update_tool_server_status(&conn.user_id, &conn.connection_id, status)
            .await;
    }

    /// Run a tool on the user's agent.
    pub async fn execute_tool(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ToolError> {
        self.router
            .execute_tool(user_id, tool_name, arguments, timeout)
            .await
    }

    pub async fn get_status(&self, user_id: &str) -> AgentStatus {
        self.status.get_status(user_id).await
    }

    /// Create a credential record and sign the agent credential for it.
    pub async fn issue_credential(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
        ttl_secs: i64,
    ) -> Result<IssuedCredential, CredentialError> {
        let id = uuid::Uuid::new_v4().to_string();
        let expires_at = unix_timestamp() + ttl_secs;
        let token = self
            .gateway
            .jwt()
            .issue_agent_token(user_id, &id, expires_at)?;
        let prefix: String = token.chars().take(TOKEN_PREFIX_LEN).collect();

        let record = self
            .db
            .create_credential(&NewCredential {
                id: &id,
                user_id,
                name,
                description,
                token_hash: &JwtManager::hash_token(&token),
                token_prefix: &prefix,
                expires_at,
            })
            .await?;

        info!(user_id = %user_id, credential_id = %id, "Agent credential issued");
        Ok(IssuedCredential { token, record })
    }

    /// Revoke a credential and tear down the live connection using it.
    pub async fn revoke_credential(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<bool, DatabaseError> {
        if !self.gateway.revoke(credential_id, user_id).await? {
            return Ok(false);
        }
        info!(user_id = %user_id, credential_id = %credential_id, "Agent credential revoked");

        if let Some(conn) = self.registry.get(user_id).await {
            if conn.credential_id == credential_id {
                self.disconnect(&conn, DisconnectReason::CredentialRevoked)
                    .await;
            }
        }
        Ok(true)
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, EnvelopeError> {
    serde_json::from_value(payload).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "relay_tests.rs"]
mod tests;
