//! Data models for relay storage.

use serde::{Deserialize, Serialize};

/// A credential issued to a desktop agent. The raw secret is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentCredential {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub token_prefix: String,
    pub expires_at: i64,
    pub active: i64,
    pub revoked: i64,
    pub revoked_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub last_origin: Option<String>,
    pub created_at: i64,
}

impl AgentCredential {
    pub const fn is_revoked(&self) -> bool {
        self.revoked != 0 || self.active == 0
    }

    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Fields needed to create a credential row.
#[derive(Debug, Clone)]
pub struct NewCredential<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub token_hash: &'a str,
    pub token_prefix: &'a str,
    pub expires_at: i64,
}

/// One row of connection history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentConnectionRecord {
    pub id: String,
    pub user_id: String,
    pub credential_id: String,
    /// `connected`, `mcp_connected` or `disconnected`.
    pub status: String,
    pub agent_version: Option<String>,
    pub agent_platform: Option<String>,
    pub agent_hostname: Option<String>,
    pub mcp_host: Option<String>,
    pub mcp_project_name: Option<String>,
    pub mcp_engine_version: Option<String>,
    pub mcp_tools_count: i64,
    pub commands_executed: i64,
    pub connected_at: i64,
    pub last_command_at: Option<i64>,
    pub disconnected_at: Option<i64>,
    pub disconnect_reason: Option<String>,
}

/// Nested tool-server fields written on a status change.
#[derive(Debug, Clone, Default)]
pub struct ToolServerFields<'a> {
    pub connected: bool,
    pub host: Option<&'a str>,
    pub project_name: Option<&'a str>,
    pub engine_version: Option<&'a str>,
    pub tools_count: i64,
}
