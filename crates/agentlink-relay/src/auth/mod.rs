//! Authentication for the agentlink relay.
//!
//! Provides JWT token management and the agent authentication gateway.

pub mod claims;
pub mod gateway;
pub mod jwt;

pub use claims::Claims;
pub use gateway::{AgentIdentity, AuthFailure, AuthGateway};
pub use jwt::JwtManager;
