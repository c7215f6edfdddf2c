//! Tool call routing to connected agents.

mod forwarder;

pub use forwarder::ToolRouter;
