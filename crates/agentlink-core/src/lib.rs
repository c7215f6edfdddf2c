//! agentlink Core Library
//!
//! Shared functionality for agentlink components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool opener, database errors and the shared clock
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::RelayConfig;
pub use error::{Error, Result};
