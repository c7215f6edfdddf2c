//! Connection registry: at most one live agent connection per user.

mod connection;
mod heartbeat;

pub use connection::{
    AgentConnection, AgentMetadata, ConnectionSnapshot, ConnectionStatus, DisconnectReason,
    PendingOutcome, ToolServerStatus,
};
pub use heartbeat::{HeartbeatMonitor, SweepReport};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::info;

use crate::protocol::Envelope;

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected {
        user_id: String,
        connection_id: String,
        credential_id: String,
        metadata: AgentMetadata,
    },
    Disconnected {
        user_id: String,
        connection_id: String,
        reason: DisconnectReason,
    },
    ToolServerChanged {
        user_id: String,
        connection_id: String,
        status: ToolServerStatus,
    },
    AgentInfoChanged {
        user_id: String,
        connection_id: String,
        metadata: AgentMetadata,
    },
    CommandExecuted {
        user_id: String,
        connection_id: String,
        at: i64,
    },
}

type Slot = Arc<Mutex<Option<Arc<AgentConnection>>>>;

/// Registry of active agent connections, keyed by user id.
///
/// The outer map is only held long enough to find a user's slot. Each slot
/// has its own lock, so installs and removals for one user serialize with
/// each other without blocking any other user. Slots are never pruned; an
/// empty slot is one `Arc` per user seen since startup.
pub struct ConnectionRegistry {
    slots: RwLock<HashMap<String, Slot>>,
    events: broadcast::Sender<RelayEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            slots: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn slot(&self, user_id: &str) -> Option<Slot> {
        self.slots.read().await.get(user_id).cloned()
    }

    async fn slot_or_create(&self, user_id: &str) -> Slot {
        if let Some(slot) = self.slot(user_id).await {
            return slot;
        }
        Arc::clone(
            self.slots
                .write()
                .await
                .entry(user_id.to_string())
                .or_default(),
        )
    }

    /// Install a new connection for `user_id`.
    ///
    /// Any existing connection for the same user is torn down with
    /// [`DisconnectReason::Replaced`] (its pending requests fail with
    /// `ConnectionLost`) before the new one becomes visible.
    pub async fn install(
        &self,
        user_id: &str,
        credential_id: &str,
        metadata: AgentMetadata,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<AgentConnection> {
        let conn = Arc::new(AgentConnection::new(
            user_id.to_string(),
            credential_id.to_string(),
            metadata.clone(),
            outbound,
        ));

        let slot = self.slot_or_create(user_id).await;
        let mut current = slot.lock().await;

        if let Some(old) = current.take() {
            if old.shutdown(DisconnectReason::Replaced).await {
                info!(
                    user_id = %user_id,
                    old_connection_id = %old.connection_id,
                    "Replacing existing agent connection"
                );
                self.publish(RelayEvent::Disconnected {
                    user_id: user_id.to_string(),
                    connection_id: old.connection_id.clone(),
                    reason: DisconnectReason::Replaced,
                });
            }
        }

        *current = Some(Arc::clone(&conn));
        drop(current);

        info!(
            user_id = %user_id,
            connection_id = %conn.connection_id,
            credential_id = %credential_id,
            "Agent connection registered"
        );
        self.publish(RelayEvent::Connected {
            user_id: user_id.to_string(),
            connection_id: conn.connection_id.clone(),
            credential_id: credential_id.to_string(),
            metadata,
        });

        conn
    }

    /// The user's live connection, if any.
    pub async fn get(&self, user_id: &str) -> Option<Arc<AgentConnection>> {
        let slot = self.slot(user_id).await?;
        let current = slot.lock().await;
        current.clone()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.get(user_id).await.is_some()
    }

    /// Tear down and remove the user's connection, whichever it is.
    pub async fn remove(
        &self,
        user_id: &str,
        reason: DisconnectReason,
    ) -> Option<Arc<AgentConnection>> {
        let slot = self.slot(user_id).await?;
        let mut current = slot.lock().await;
        let conn = current.take()?;
        drop(current);

        self.finish_removal(&conn, reason).await;
        Some(conn)
    }

    /// Remove the user's connection only if it is still `connection_id`.
    ///
    /// A transport loop calls this on exit; after an eviction its connection
    /// is no longer the installed one and the replacement is left alone.
    pub async fn remove_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        reason: DisconnectReason,
    ) -> bool {
        let Some(slot) = self.slot(user_id).await else {
            return false;
        };
        let mut current = slot.lock().await;
        let Some(conn) = current
            .as_ref()
            .filter(|c| c.connection_id == connection_id)
            .cloned()
        else {
            return false;
        };
        *current = None;
        drop(current);

        self.finish_removal(&conn, reason).await;
        true
    }

    async fn finish_removal(&self, conn: &AgentConnection, reason: DisconnectReason) {
        if conn.shutdown(reason.clone()).await {
            info!(
                user_id = %conn.user_id,
                connection_id = %conn.connection_id,
                reason = %reason,
                "Agent connection removed"
            );
            self.publish(RelayEvent::Disconnected {
                user_id: conn.user_id.clone(),
                connection_id: conn.connection_id.clone(),
                reason,
            });
        }
    }

    /// Apply a tool-server status reported on `connection_id`.
    ///
    /// Returns `false` (and changes nothing) if that connection is no longer
    /// the user's installed one.
    pub async fn update_tool_server_status(
        &self,
        user_id: &str,
        connection_id: &str,
        status: ToolServerStatus,
    ) -> bool {
        let Some(conn) = self.get_current(user_id, connection_id).await else {
            return false;
        };
        if !conn.set_tool_server(status.clone()).await {
            return false;
        }
        self.publish(RelayEvent::ToolServerChanged {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            status,
        });
        true
    }

    pub async fn update_agent_info(
        &self,
        user_id: &str,
        connection_id: &str,
        metadata: AgentMetadata,
    ) -> bool {
        let Some(conn) = self.get_current(user_id, connection_id).await else {
            return false;
        };
        conn.set_metadata(metadata.clone()).await;
        self.publish(RelayEvent::AgentInfoChanged {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            metadata,
        });
        true
    }

    /// Count a successful command against `connection_id` if it is still
    /// the user's installed connection.
    pub async fn record_command(&self, user_id: &str, connection_id: &str) -> bool {
        let Some(conn) = self.get_current(user_id, connection_id).await else {
            return false;
        };
        let at = conn.record_command().await;
        self.publish(RelayEvent::CommandExecuted {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            at,
        });
        true
    }

    async fn get_current(&self, user_id: &str, connection_id: &str) -> Option<Arc<AgentConnection>> {
        self.get(user_id)
            .await
            .filter(|c| c.connection_id == connection_id)
    }

    /// All live connections at this instant.
    pub async fn connections(&self) -> Vec<Arc<AgentConnection>> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(conn) = slot.lock().await.clone() {
                out.push(conn);
            }
        }
        out
    }

    pub async fn connection_count(&self) -> usize {
        self.connections().await.len()
    }

    /// Tear down every connection, e.g. on shutdown.
    pub async fn close_all(&self, reason: DisconnectReason) -> usize {
        let users: Vec<String> = self.slots.read().await.keys().cloned().collect();
        let mut closed = 0;
        for user_id in users {
            if self.remove(&user_id, reason.clone()).await.is_some() {
                closed += 1;
            }
        }
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
