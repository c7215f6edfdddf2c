//! Wire protocol spoken over the agent socket.
//!
//! Every frame is a JSON [`Envelope`]; the typed payloads for each
//! envelope kind live in [`payloads`].

pub mod envelope;
pub mod payloads;

pub use envelope::{Envelope, EnvelopeError, EnvelopeType};
