//! HTTP and WebSocket transport for the agent relay.

pub mod agent_ws;
pub mod api;
pub mod auth;
mod error;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_helpers;


pub use auth::AuthUser;
pub use error::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::relay::AgentRelay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<AgentRelay>,
}

pub fn build_router(relay: Arc<AgentRelay>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/v1/agent/ws", get(agent_ws::agent_socket))
        .route("/v1/agent/execute", post(api::execute_tool))
        .route("/v1/agent/status", get(api::get_status))
        .route(
            "/v1/agent/tokens",
            post(api::create_token).get(api::list_tokens),
        )
        .route("/v1/agent/tokens/{id}", delete(api::revoke_token))
        .route("/v1/agent/connections", get(api::list_connections))
        .with_state(AppState { relay })
}
