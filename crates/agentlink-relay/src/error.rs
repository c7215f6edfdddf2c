//! Errors returned by tool execution.

use std::time::Duration;

use crate::breaker::ceil_secs;

/// Everything `ToolRouter::execute_tool` can fail with. All of these are
/// recoverable by the caller.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Agent not connected")]
    NoActiveConnection,

    #[error("Agent is connected but its tool server is not")]
    McpNotConnected,

    #[error("Tool timed out after {}s", ceil_secs(*timeout))]
    ToolTimeout { timeout: Duration },

    #[error("{0}")]
    ToolExecution(String),

    #[error("Too many recent failures, try again in {}s", ceil_secs(*retry_after).max(1))]
    CircuitOpen { retry_after: Duration },

    #[error("Agent connection lost before the tool finished")]
    ConnectionLost,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ToolError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoActiveConnection => "no_active_connection",
            Self::McpNotConnected => "mcp_not_connected",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ToolExecution(_) => "tool_execution_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ConnectionLost => "connection_lost",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether the circuit breaker counts this outcome as a failure.
    pub const fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::ToolTimeout { .. } | Self::ToolExecution(_) | Self::ConnectionLost
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::CircuitOpen { retry_after } => Some(ceil_secs(*retry_after).max(1)),
            _ => None,
        }
    }
}
