//! Connection history queries.

use agentlink_core::db::unix_timestamp;

use super::db::{DatabaseError, RelayDatabase};
use super::models::{AgentConnectionRecord, ToolServerFields};

/// Fields recorded when an agent connects.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOpened<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub credential_id: &'a str,
    pub agent_version: Option<&'a str>,
    pub agent_platform: Option<&'a str>,
    pub agent_hostname: Option<&'a str>,
    pub connected_at: i64,
}

impl RelayDatabase {
    pub async fn record_connection(
        &self,
        opened: &ConnectionOpened<'_>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO agent_connections (id, user_id, credential_id, agent_version, agent_platform, agent_hostname, connected_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(opened.id)
        .bind(opened.user_id)
        .bind(opened.credential_id)
        .bind(opened.agent_version)
        .bind(opened.agent_platform)
        .bind(opened.agent_hostname)
        .bind(opened.connected_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_connection(&self, id: &str) -> Result<AgentConnectionRecord, DatabaseError> {
        sqlx::query_as::<_, AgentConnectionRecord>("SELECT * FROM agent_connections WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Connection {id}")))
    }

    /// Apply a tool-server status change. Ignored once the row is closed.
    pub async fn update_connection_tool_server(
        &self,
        id: &str,
        fields: &ToolServerFields<'_>,
    ) -> Result<bool, DatabaseError> {
        let status = if fields.connected {
            "mcp_connected"
        } else {
            "connected"
        };
        let result = sqlx::query(
            "UPDATE agent_connections SET status = ?, mcp_host = ?, mcp_project_name = ?, mcp_engine_version = ?, mcp_tools_count = ? WHERE id = ? AND status != 'disconnected'",
        )
        .bind(status)
        .bind(fields.host)
        .bind(fields.project_name)
        .bind(fields.engine_version)
        .bind(fields.tools_count)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_connection_agent_info(
        &self,
        id: &str,
        version: Option<&str>,
        platform: Option<&str>,
        hostname: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_connections SET agent_version = ?, agent_platform = ?, agent_hostname = ? WHERE id = ?",
        )
        .bind(version)
        .bind(platform)
        .bind(hostname)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_connection_command(&self, id: &str, at: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_connections SET commands_executed = commands_executed + 1, last_command_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close a connection row, clearing its tool-server fields.
    pub async fn record_disconnect(&self, id: &str, reason: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_connections SET status = 'disconnected', disconnected_at = ?, disconnect_reason = ?, mcp_host = NULL, mcp_project_name = NULL, mcp_engine_version = NULL, mcp_tools_count = 0 WHERE id = ? AND status != 'disconnected'",
        )
        .bind(unix_timestamp())
        .bind(reason)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A user's connections that have not been closed, newest first.
    pub async fn list_active_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<AgentConnectionRecord>, DatabaseError> {
        let rows = sqlx::query_as::<_, AgentConnectionRecord>(
            "SELECT * FROM agent_connections WHERE user_id = ? AND status != 'disconnected' ORDER BY connected_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Close rows left open by a previous process. Returns how many.
    pub async fn close_stale_connections(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_connections SET status = 'disconnected', disconnected_at = ?, disconnect_reason = 'relay_restart' WHERE status != 'disconnected'",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
