//! JWT claims structure for agentlink relay auth.

use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN: &str = "access";
pub const AGENT_TOKEN: &str = "agent";

/// JWT claims embedded in access tokens and agent credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// JWT ID (unique per token).
    pub jti: String,
    /// Subject (user ID).
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// Token type: "access" or "agent".
    pub token_type: String,
    /// Credential record ID, present on agent credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

impl Claims {
    pub fn is_access(&self) -> bool {
        self.token_type == ACCESS_TOKEN
    }

    pub fn is_agent(&self) -> bool {
        self.token_type == AGENT_TOKEN
    }
}
