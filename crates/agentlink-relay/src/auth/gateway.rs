//! Authentication gateway for agent sockets.
//!
//! Verifies a signed agent credential and confirms its record is still
//! usable. It never touches the socket; the transport decides how to close
//! on failure.

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use tracing::{debug, error, warn};

use agentlink_core::db::unix_timestamp;

use super::jwt::JwtManager;
use crate::storage::{CredentialStore, DatabaseError};

/// Why an agent credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("Token expired")]
    Expired,

    #[error("Malformed token")]
    Malformed,

    #[error("Token revoked")]
    Revoked,

    #[error("Unknown token")]
    Unknown,
}

impl AuthFailure {
    /// WebSocket close code sent to the agent.
    pub const fn close_code(self) -> u16 {
        match self {
            Self::Expired => 4001,
            Self::Malformed => 4002,
            Self::Revoked => 4003,
            Self::Unknown => 4004,
        }
    }
}

/// A validated `(user_id, credential_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub user_id: String,
    pub credential_id: String,
}

#[derive(Clone)]
pub struct AuthGateway {
    jwt: JwtManager,
    store: Arc<dyn CredentialStore>,
}

impl AuthGateway {
    pub fn new(jwt: JwtManager, store: Arc<dyn CredentialStore>) -> Self {
        Self { jwt, store }
    }

    pub const fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    pub async fn authenticate(&self, raw: &str) -> Result<AgentIdentity, AuthFailure> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthFailure::Malformed);
        }

        let claims = self.jwt.validate(raw).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthFailure::Expired,
            _ => {
                debug!(error = %e, "Agent credential failed validation");
                AuthFailure::Malformed
            }
        })?;

        if !claims.is_agent() {
            return Err(AuthFailure::Malformed);
        }
        let Some(credential_id) = claims.cid.filter(|c| !c.is_empty()) else {
            return Err(AuthFailure::Malformed);
        };

        let record = match self.store.lookup(&credential_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(AuthFailure::Unknown),
            Err(e) => {
                error!(credential_id = %credential_id, error = %e, "Credential lookup failed");
                return Err(AuthFailure::Unknown);
            }
        };

        // A record for another user or a reissued secret is not this token.
        if record.user_id != claims.sub || record.token_hash != JwtManager::hash_token(raw) {
            return Err(AuthFailure::Unknown);
        }
        if record.is_revoked() {
            return Err(AuthFailure::Revoked);
        }
        if record.is_expired(unix_timestamp()) {
            return Err(AuthFailure::Expired);
        }

        Ok(AgentIdentity {
            user_id: claims.sub,
            credential_id,
        })
    }

    /// Re-read the record behind an identity that already authenticated.
    ///
    /// False once the record is gone, revoked, deactivated or expired. A
    /// failed lookup keeps the identity; revocation still reaches the live
    /// connection through the registry.
    pub async fn still_valid(&self, identity: &AgentIdentity) -> bool {
        match self.store.lookup(&identity.credential_id).await {
            Ok(Some(record)) => {
                record.user_id == identity.user_id
                    && !record.is_revoked()
                    && !record.is_expired(unix_timestamp())
            }
            Ok(None) => false,
            Err(e) => {
                warn!(credential_id = %identity.credential_id, error = %e, "Credential re-check failed");
                true
            }
        }
    }

    /// Revoke `credential_id` if it belongs to `user_id`.
    pub async fn revoke(&self, credential_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        self.store.revoke(credential_id, user_id).await
    }

    /// Stamp last-used time and origin; failures are logged only.
    pub async fn mark_used(&self, credential_id: &str, origin: Option<&str>) {
        if let Err(e) = self.store.mark_used(credential_id, origin).await {
            error!(credential_id = %credential_id, error = %e, "Failed to record credential use");
        }
    }
}
