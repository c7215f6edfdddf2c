//! Read model of a user's agent connection.

use std::sync::Arc;

use serde::Serialize;

use crate::breaker::{CircuitBreakers, CircuitState};
use crate::registry::{ConnectionRegistry, ConnectionStatus};

/// Everything a caller may want to know about a user's agent, built from
/// snapshots so no lock is held while it is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub connected: bool,
    pub connection_id: Option<String>,
    pub connected_at: Option<i64>,
    pub agent_version: Option<String>,
    pub agent_platform: Option<String>,
    pub agent_hostname: Option<String>,
    pub mcp_connected: bool,
    pub mcp_host: Option<String>,
    pub mcp_project_name: Option<String>,
    pub mcp_engine_version: Option<String>,
    pub mcp_tools_count: u32,
    pub mcp_connected_at: Option<i64>,
    pub commands_executed: u64,
    pub last_command_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub circuit_retry_after_secs: Option<u64>,
}

#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<ConnectionRegistry>,
    breakers: Arc<CircuitBreakers>,
}

impl StatusReporter {
    pub const fn new(registry: Arc<ConnectionRegistry>, breakers: Arc<CircuitBreakers>) -> Self {
        Self { registry, breakers }
    }

    pub async fn get_status(&self, user_id: &str) -> AgentStatus {
        let breaker = self.breakers.snapshot(user_id).await;

        let snapshot = match self.registry.get(user_id).await {
            Some(conn) => Some(conn.snapshot().await),
            None => None,
        }
        .filter(|s| s.status == ConnectionStatus::Connected);

        let Some(s) = snapshot else {
            return AgentStatus {
                connected: false,
                connection_id: None,
                connected_at: None,
                agent_version: None,
                agent_platform: None,
                agent_hostname: None,
                mcp_connected: false,
                mcp_host: None,
                mcp_project_name: None,
                mcp_engine_version: None,
                mcp_tools_count: 0,
                mcp_connected_at: None,
                commands_executed: 0,
                last_command_at: None,
                last_heartbeat_at: None,
                circuit_state: breaker.state,
                consecutive_failures: breaker.consecutive_failures,
                circuit_retry_after_secs: breaker.retry_after_secs,
            };
        };

        AgentStatus {
            connected: true,
            connection_id: Some(s.connection_id),
            connected_at: Some(s.connected_at),
            agent_version: s.metadata.version,
            agent_platform: s.metadata.platform,
            agent_hostname: s.metadata.hostname,
            mcp_connected: s.tool_server.connected,
            mcp_host: s.tool_server.host,
            mcp_project_name: s.tool_server.project_name,
            mcp_engine_version: s.tool_server.engine_version,
            mcp_tools_count: s.tool_server.tools_count,
            mcp_connected_at: s.tool_server.connected_at,
            commands_executed: s.commands_executed,
            last_command_at: s.last_command_at,
            last_heartbeat_at: Some(s.last_heartbeat_at),
            circuit_state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            circuit_retry_after_secs: breaker.retry_after_secs,
        }
    }
}
