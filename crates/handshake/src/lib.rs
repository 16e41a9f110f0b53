//! Authenticated ephemeral key exchange run on every new peer connection.

pub mod error;
pub mod message;
pub mod policy;

pub use error::{HandshakeError, Result};
pub use message::HandshakeMessage;
pub use policy::{HandshakeConfig, Policy, CHALLENGE, DEFAULT_TIMEOUT, TIMEOUT_KEY};
