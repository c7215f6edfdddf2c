//! agentlink Relay Server Library
//!
//! Core functionality for the agentlink relay:
//! - Agent authentication with signed, revocable credentials
//! - Connection registry with heartbeat supervision
//! - Correlated tool calls with per-user circuit breaking
//! - SQLite storage for credentials and connection history
//! - HTTP and WebSocket transport

pub mod auth;
pub mod breaker;
pub mod error;
pub mod history;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod status;
pub mod storage;

pub use relay::AgentRelay;
