//! Bearer-token extractor for REST routes.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use super::AppState;
use super::error::ApiError;
use crate::auth::Claims;

/// Caller identity from a valid access token. Agent credentials are refused.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub claims: Claims,
}

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or(ApiError::Unauthorized("Missing authorization header"))?;

        let claims = state
            .relay
            .gateway()
            .jwt()
            .validate(token)
            .map_err(|_| ApiError::Unauthorized("Invalid token"))?;

        if !claims.is_access() {
            return Err(ApiError::Unauthorized("Not an access token"));
        }

        Ok(Self {
            user_id: claims.sub.clone(),
            claims,
        })
    }
}
