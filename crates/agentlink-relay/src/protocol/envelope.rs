//! JSON envelope exchanged between the relay and a desktop agent.
//!
//! ```json
//! {"type": "tool_request", "payload": {...}, "correlation_id": "...", "timestamp": 1700000000}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use agentlink_core::db::unix_timestamp;

/// Envelope kinds understood by both ends of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Connect,
    Disconnect,
    Heartbeat,
    ToolStatusUpdate,
    ToolRequest,
    ToolResponse,
    Error,
}

impl EnvelopeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Heartbeat => "heartbeat",
            Self::ToolStatusUpdate => "tool_status_update",
            Self::ToolRequest => "tool_request",
            Self::ToolResponse => "tool_response",
            Self::Error => "error",
        }
    }

    /// Kinds that are meaningless without a correlation id.
    const fn requires_correlation(self) -> bool {
        matches!(self, Self::ToolRequest | Self::ToolResponse)
    }
}

/// A single frame on the agent socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Unix seconds at which the sender built the frame.
    #[serde(default)]
    pub timestamp: i64,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    #[error("Envelope of type {0} requires a correlation_id")]
    MissingCorrelation(&'static str),

    #[error("Envelope of type {0} is not accepted from agents")]
    Unexpected(&'static str),

    #[error("Binary frames are not supported")]
    Binary,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            correlation_id: None,
            timestamp: unix_timestamp(),
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Handshake acknowledgement sent right after a connection is installed.
    pub fn connect_ack(connection_id: &str, user_id: &str, heartbeat_interval_secs: u64) -> Self {
        Self::new(
            EnvelopeType::Connect,
            json!({
                "connection_id": connection_id,
                "user_id": user_id,
                "heartbeat_interval_secs": heartbeat_interval_secs,
            }),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(
            EnvelopeType::Heartbeat,
            json!({ "server_time": unix_timestamp() }),
        )
    }

    pub fn disconnect(reason: &str) -> Self {
        Self::new(EnvelopeType::Disconnect, json!({ "reason": reason }))
    }

    pub fn error(message: &str) -> Self {
        Self::new(EnvelopeType::Error, json!({ "error": message }))
    }

    pub fn tool_request(
        correlation_id: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> Self {
        Self::new(
            EnvelopeType::ToolRequest,
            json!({ "tool_name": tool_name, "arguments": arguments }),
        )
        .with_correlation(correlation_id)
    }

    /// Parse and validate a text frame.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let raw: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let Some(kind) = raw.get("type").and_then(Value::as_str) else {
            return Err(EnvelopeError::Malformed("missing string field `type`".into()));
        };
        let kind: EnvelopeType = serde_json::from_value(Value::String(kind.to_string()))
            .map_err(|_| EnvelopeError::UnknownType(kind.to_string()))?;

        let envelope: Self =
            serde_json::from_value(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if !envelope.payload.is_object() {
            return Err(EnvelopeError::Malformed("`payload` must be an object".into()));
        }
        if kind.requires_correlation()
            && envelope.correlation_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(EnvelopeError::MissingCorrelation(kind.as_str()));
        }

        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
