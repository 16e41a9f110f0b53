use std::sync::Arc;

use mesh_callbacks::CallbackResult;
use mesh_types::{Message, Opcode};

use crate::node::Node;
use crate::peer::Peer;

/// Capability a handshake implementation exposes to the node.
///
/// Installed with [`Node::install_policy`]: the node routes every inbound
/// message carrying one of [`installed_opcodes`](Self::installed_opcodes) to
/// [`on_message`](Self::on_message), then calls
/// [`on_policy_installed`](Self::on_policy_installed) once.
#[cfg_attr(test, mockall::automock)]
pub trait HandshakePolicy: Send + Sync {
    fn installed_opcodes(&self) -> Vec<Opcode>;

    fn on_policy_installed(&self, node: &Arc<Node>);

    /// Handle one message. The return value follows the callback convention:
    /// `Ok` keeps the handler registered for this peer, the sentinel removes
    /// it, any other error removes it and is logged by the node.
    fn on_message(&self, peer: &Arc<Peer>, message: &Message) -> CallbackResult;
}
