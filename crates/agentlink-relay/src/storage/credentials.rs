//! Credential Record collaborator seen by the authentication gateway.

use async_trait::async_trait;

use super::db::{DatabaseError, RelayDatabase};
use super::models::AgentCredential;

/// Lookup, revocation and last-used tracking for agent credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Option<AgentCredential>, DatabaseError>;

    /// Revoke `id` if it belongs to `user_id`.
    async fn revoke(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError>;

    /// Stamp last-used time and the network origin of the connecting agent.
    async fn mark_used(&self, id: &str, origin: Option<&str>) -> Result<(), DatabaseError>;
}

#[async_trait]
impl CredentialStore for RelayDatabase {
    async fn lookup(&self, id: &str) -> Result<Option<AgentCredential>, DatabaseError> {
        self.find_credential(id).await
    }

    async fn revoke(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        self.revoke_credential(id, user_id).await
    }

    async fn mark_used(&self, id: &str, origin: Option<&str>) -> Result<(), DatabaseError> {
        self.touch_credential(id, origin).await.map(|_| ())
    }
}
