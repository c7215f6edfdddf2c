//! REST handlers for the signed-in user.

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

use super::AppState;
use super::auth::AuthUser;
use super::error::ApiError;
use crate::error::ToolError;
use crate::status::AgentStatus;
use crate::storage::{AgentConnectionRecord, AgentCredential};

const SECS_PER_DAY: i64 = 86_400;
const MAX_EXPIRES_DAYS: i64 = 365;
const MAX_TOKEN_NAME_LEN: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTokenRequest {
    pub name: String,
    pub description: Option<String>,
    pub expires_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub id: String,
    /// Shown once; only its hash is stored.
    pub token: String,
    pub token_prefix: String,
    pub name: String,
    pub expires_at: i64,
}

const fn tool_error_status(error: &ToolError) -> StatusCode {
    match error {
        ToolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ToolError::NoActiveConnection | ToolError::McpNotConnected | ToolError::CircuitOpen { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ToolError::ToolTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ToolError::ToolExecution(_) | ToolError::ConnectionLost => StatusCode::BAD_GATEWAY,
    }
}

fn parse_timeout(timeout_secs: Option<f64>) -> Result<Option<Duration>, ToolError> {
    let Some(secs) = timeout_secs else {
        return Ok(None);
    };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ToolError::InvalidRequest(
            "timeout_secs must be a positive number".into(),
        ));
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| ToolError::InvalidRequest("timeout_secs is out of range".into()))
}

/// `POST /v1/agent/execute`
#[instrument(skip_all, fields(user_id = %user.user_id, tool_name = %req.tool_name))]
pub async fn execute_tool(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    let started = Instant::now();
    let outcome = match parse_timeout(req.timeout_secs) {
        Ok(timeout) => {
            state
                .relay
                .execute_tool(&user.user_id, &req.tool_name, req.arguments, timeout)
                .await
        }
        Err(e) => Err(e),
    };
    let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(result) => Json(ExecuteResponse {
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            retry_after_secs: None,
            execution_time_ms,
        })
        .into_response(),
        Err(e) => {
            info!(error = %e, code = e.code(), "Tool execution failed");
            let retry_after = e.retry_after_secs();
            let body = Json(ExecuteResponse {
                success: false,
                result: None,
                error: Some(e.to_string()),
                error_code: Some(e.code()),
                retry_after_secs: retry_after,
                execution_time_ms,
            });
            let mut response = (tool_error_status(&e), body).into_response();
            if let Some(secs) = retry_after {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            response
        }
    }
}

/// `GET /v1/agent/status`
pub async fn get_status(State(state): State<AppState>, user: AuthUser) -> Json<AgentStatus> {
    Json(state.relay.get_status(&user.user_id).await)
}

/// `POST /v1/agent/tokens`
#[instrument(skip_all, fields(user_id = %user.user_id))]
pub async fn create_token(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > MAX_TOKEN_NAME_LEN {
        return Err(ApiError::InvalidRequest(format!(
            "name must be 1 to {MAX_TOKEN_NAME_LEN} characters"
        )));
    }
    let ttl_secs = match req.expires_days {
        Some(days) if (1..=MAX_EXPIRES_DAYS).contains(&days) => days * SECS_PER_DAY,
        Some(_) => {
            return Err(ApiError::InvalidRequest(format!(
                "expires_days must be between 1 and {MAX_EXPIRES_DAYS}"
            )));
        }
        None => state.relay.config().auth.agent_token_ttl_secs,
    };
    let description = req.description.as_deref().filter(|d| !d.trim().is_empty());

    let issued = state
        .relay
        .issue_credential(&user.user_id, name, description, ttl_secs)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            id: issued.record.id,
            token: issued.token,
            token_prefix: issued.record.token_prefix,
            name: issued.record.name,
            expires_at: issued.record.expires_at,
        }),
    ))
}

/// `GET /v1/agent/tokens`
pub async fn list_tokens(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<AgentCredential>>, ApiError> {
    Ok(Json(state.relay.db().list_credentials(&user.user_id).await?))
}

/// `DELETE /v1/agent/tokens/{id}`
#[instrument(skip_all, fields(user_id = %user.user_id, credential_id = %id))]
pub async fn revoke_token(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.relay.revoke_credential(&user.user_id, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Credential {id}")))
    }
}

/// `GET /v1/agent/connections`
pub async fn list_connections(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<AgentConnectionRecord>>, ApiError> {
    Ok(Json(
        state
            .relay
            .db()
            .list_active_connections(&user.user_id)
            .await?,
    ))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let connections = state.relay.registry().connection_count().await;
    Json(json!({ "status": "ok", "connections": connections }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_must_be_positive_and_finite() {
        assert_eq!(parse_timeout(None), Ok(None));
        assert_eq!(parse_timeout(Some(1.5)), Ok(Some(Duration::from_millis(1500))));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                parse_timeout(Some(bad)),
                Err(ToolError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn tool_errors_map_to_gateway_statuses() {
        assert_eq!(
            tool_error_status(&ToolError::NoActiveConnection),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            tool_error_status(&ToolError::ToolTimeout {
                timeout: Duration::from_secs(1)
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            tool_error_status(&ToolError::ConnectionLost),
            StatusCode::BAD_GATEWAY
        );
    }
}
