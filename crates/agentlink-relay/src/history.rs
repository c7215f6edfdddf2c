//! Persists relay events into the connection history table.

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::registry::RelayEvent;
use crate::storage::{ConnectionOpened, DatabaseError, RelayDatabase, ToolServerFields};

/// Writes [`RelayEvent`]s to `agent_connections`. Failures are logged and
/// never reach the relay paths that produced the event.
#[derive(Clone)]
pub struct HistoryRecorder {
    db: RelayDatabase,
}

impl HistoryRecorder {
    pub const fn new(db: RelayDatabase) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: &RelayEvent) -> Result<(), DatabaseError> {
        match event {
            RelayEvent::Connected {
                user_id,
                connection_id,
                credential_id,
                metadata,
            } => {
                self.db
                    .record_connection(&ConnectionOpened {
                        id: connection_id,
                        user_id,
                        credential_id,
                        agent_version: metadata.version.as_deref(),
                        agent_platform: metadata.platform.as_deref(),
                        agent_hostname: metadata.hostname.as_deref(),
                        connected_at: agentlink_core::db::unix_timestamp(),
                    })
                    .await
            }
            RelayEvent::Disconnected {
                connection_id,
                reason,
                ..
            } => self
                .db
                .record_disconnect(connection_id, reason.as_str())
                .await
                .map(|_| ()),
            RelayEvent::ToolServerChanged {
                connection_id,
                status,
                ..
            } => self
                .db
                .update_connection_tool_server(
                    connection_id,
                    &ToolServerFields {
                        connected: status.connected,
                        host: status.host.as_deref(),
                        project_name: status.project_name.as_deref(),
                        engine_version: status.engine_version.as_deref(),
                        tools_count: i64::from(status.tools_count),
                    },
                )
                .await
                .map(|_| ()),
            RelayEvent::AgentInfoChanged {
                connection_id,
                metadata,
                ..
            } => self
                .db
                .update_connection_agent_info(
                    connection_id,
                    metadata.version.as_deref(),
                    metadata.platform.as_deref(),
                    metadata.hostname.as_deref(),
                )
                .await
                .map(|_| ()),
            RelayEvent::CommandExecuted {
                connection_id, at, ..
            } => self
                .db
                .record_connection_command(connection_id, *at)
                .await
                .map(|_| ()),
        }
    }

    async fn record_logged(&self, event: &RelayEvent) {
        if let Err(e) = self.record(event).await {
            warn!(error = %e, ?event, "Failed to record connection history");
        }
    }

    /// Spawn the recorder loop. On shutdown it drains events already
    /// queued, so teardown records written during `stop` are kept.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<RelayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => self.record_logged(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "History recorder lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => {
                        while let Ok(event) = events.try_recv() {
                            self.record_logged(&event).await;
                        }
                        info!("History recorder shutting down");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{AgentMetadata, DisconnectReason, ToolServerStatus};

    fn connected(id: &str) -> RelayEvent {
        RelayEvent::Connected {
            user_id: "u1".into(),
            connection_id: id.into(),
            credential_id: "c1".into(),
            metadata: AgentMetadata {
                version: Some("1.0.0".into()),
                platform: None,
                hostname: None,
            },
        }
    }

    #[tokio::test]
    async fn records_full_lifecycle() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let recorder = HistoryRecorder::new(db.clone());

        recorder.record(&connected("conn-1")).await.unwrap();
        recorder
            .record(&RelayEvent::ToolServerChanged {
                user_id: "u1".into(),
                connection_id: "conn-1".into(),
                status: ToolServerStatus {
                    connected: true,
                    tools_count: 7,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        recorder
            .record(&RelayEvent::CommandExecuted {
                user_id: "u1".into(),
                connection_id: "conn-1".into(),
                at: 1_700_000_000,
            })
            .await
            .unwrap();

        let row = db.get_connection("conn-1").await.unwrap();
        assert_eq!(row.status, "mcp_connected");
        assert_eq!(row.mcp_tools_count, 7);
        assert_eq!(row.commands_executed, 1);
        assert_eq!(row.agent_version.as_deref(), Some("1.0.0"));

        recorder
            .record(&RelayEvent::Disconnected {
                user_id: "u1".into(),
                connection_id: "conn-1".into(),
                reason: DisconnectReason::Replaced,
            })
            .await
            .unwrap();
        let row = db.get_connection("conn-1").await.unwrap();
        assert_eq!(row.status, "disconnected");
        assert_eq!(row.disconnect_reason.as_deref(), Some("replaced"));
    }

    #[tokio::test]
    async fn spawned_recorder_drains_on_shutdown() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let (tx, rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = HistoryRecorder::new(db.clone()).spawn(rx, shutdown_rx);

        tx.send(connected("conn-1")).unwrap();
        tx.send(RelayEvent::Disconnected {
            user_id: "u1".into(),
            connection_id: "conn-1".into(),
            reason: DisconnectReason::ServerShutdown,
        })
        .unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let row = db.get_connection("conn-1").await.unwrap();
        assert_eq!(row.disconnect_reason.as_deref(), Some("server_shutdown"));
    }
}
