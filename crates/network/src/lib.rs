//! Peer connections for the handshake mesh.
//!
//! A [`Node`] owns length-prefixed framed connections and exposes their
//! lifecycle through callback registries: connect/disconnect notifications,
//! per-opcode message handlers, and inbound/outbound middleware. Handshake
//! implementations plug in through [`HandshakePolicy`].

pub mod codec;
pub mod node;
pub mod peer;
pub mod policy;
pub mod session;
pub mod timeout;

pub use node::{MessageHandler, Node, NodeConfig};
pub use peer::{Delivery, Peer};
pub use policy::HandshakePolicy;
pub use session::PeerSession;
