//! SQLite storage for the agentlink relay.
//!
//! Persists agent credentials and connection history. The relay itself only
//! sees credentials through the [`CredentialStore`] trait.

mod credentials;
mod db;
mod models;
mod queries;
mod queries_connections;


pub use credentials::CredentialStore;
pub use db::{DatabaseError, RelayDatabase};
pub use models::*;
pub use queries_connections::ConnectionOpened;
