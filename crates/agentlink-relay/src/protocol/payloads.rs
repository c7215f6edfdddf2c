//! Typed payloads carried inside [`Envelope`](super::Envelope)s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::{AgentMetadata, ToolServerStatus};

/// Agent self-description, sent in an agent-originated `connect` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfoPayload {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl AgentInfoPayload {
    /// Overlay the reported fields onto `current`, keeping what was not sent.
    pub fn apply_to(self, current: &AgentMetadata) -> AgentMetadata {
        AgentMetadata {
            version: self.version.or_else(|| current.version.clone()),
            platform: self.platform.or_else(|| current.platform.clone()),
            hostname: self.hostname.or_else(|| current.hostname.clone()),
        }
    }
}

/// The agent's link to the editor tool server went up or down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStatusPayload {
    pub connected: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub tools_count: Option<u32>,
    /// Older agents send the tool list instead of a count.
    #[serde(default)]
    pub available_tools: Option<Vec<Value>>,
}

impl ToolStatusPayload {
    pub fn into_status(self, now: i64) -> ToolServerStatus {
        if !self.connected {
            return ToolServerStatus::default();
        }
        let tools_count = self.tools_count.unwrap_or_else(|| {
            self.available_tools
                .as_ref()
                .map_or(0, |tools| u32::try_from(tools.len()).unwrap_or(u32::MAX))
        });
        ToolServerStatus {
            connected: true,
            host: self.host,
            project_name: self.project_name,
            engine_version: self.engine_version,
            tools_count,
            connected_at: Some(now),
        }
    }
}

/// Tool-server state an agent may piggyback on a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default, alias = "ue5_status")]
    pub tool_server_status: Option<String>,
}

impl HeartbeatPayload {
    /// `None` when the heartbeat says nothing about the tool server.
    pub fn tool_server_connected(&self) -> Option<bool> {
        self.tool_server_status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| s == "connected")
    }
}

/// Interpret a `tool_response` payload.
///
/// `{"error": "..."}` (or `"success": false`) is a tool failure; otherwise
/// the `result` field is the result, falling back to the whole payload when
/// an agent sends the result inline.
pub fn tool_reply(payload: &Value) -> Result<Value, String> {
    match payload.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(message)) => return Err(message.clone()),
        Some(other) => return Err(other.to_string()),
    }
    if payload.get("success").and_then(Value::as_bool) == Some(false) {
        return Err("Tool reported failure".to_string());
    }
    Ok(payload
        .get("result")
        .cloned()
        .unwrap_or_else(|| payload.clone()))
}

/// Error text from an agent `error` envelope.
pub fn error_message(payload: &Value) -> String {
    payload
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string()
}
