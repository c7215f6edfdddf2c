//! Credential queries.

use agentlink_core::db::unix_timestamp;

use super::db::{DatabaseError, RelayDatabase};
use super::models::{AgentCredential, NewCredential};

impl RelayDatabase {
    /// Store a newly issued credential.
    pub async fn create_credential(
        &self,
        new: &NewCredential<'_>,
    ) -> Result<AgentCredential, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO agent_credentials (id, user_id, name, description, token_hash, token_prefix, expires_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(new.name)
        .bind(new.description)
        .bind(new.token_hash)
        .bind(new.token_prefix)
        .bind(new.expires_at)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_credential(new.id).await
    }

    /// Get a credential by ID.
    pub async fn get_credential(&self, id: &str) -> Result<AgentCredential, DatabaseError> {
        self.find_credential(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Credential {id}")))
    }

    pub async fn find_credential(&self, id: &str) -> Result<Option<AgentCredential>, DatabaseError> {
        let credential =
            sqlx::query_as::<_, AgentCredential>("SELECT * FROM agent_credentials WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(credential)
    }

    /// List a user's credentials, newest first.
    pub async fn list_credentials(
        &self,
        user_id: &str,
    ) -> Result<Vec<AgentCredential>, DatabaseError> {
        let credentials = sqlx::query_as::<_, AgentCredential>(
            "SELECT * FROM agent_credentials WHERE user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(credentials)
    }

    /// Revoke a credential owned by `user_id`. Returns `false` if it does not
    /// exist, belongs to someone else, or is already revoked.
    pub async fn revoke_credential(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_credentials SET revoked = 1, active = 0, revoked_at = ? WHERE id = ? AND user_id = ? AND revoked = 0",
        )
        .bind(unix_timestamp())
        .bind(id)
        .bind(user_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a successful agent connection with this credential.
    pub async fn touch_credential(
        &self,
        id: &str,
        origin: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_credentials SET last_used_at = ?, last_origin = COALESCE(?, last_origin) WHERE id = ?",
        )
        .bind(unix_timestamp())
        .bind(origin)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
