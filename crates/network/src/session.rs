//! Per-peer handshake state.

use mesh_crypto::{EphemeralKeyPair, SharedKey};

/// Typed attribute store for handshake state.
///
/// Always accessed through [`Peer::with_session`](crate::Peer::with_session),
/// which holds the peer's session lock for the whole closure. Taking the
/// ephemeral key and installing the session key in one closure is therefore
/// a single step for any concurrent reader.
#[derive(Debug, Default)]
pub struct PeerSession {
    ephemeral_key: Option<EphemeralKeyPair>,
    session_key: Option<SharedKey>,
}

impl PeerSession {
    pub fn has_ephemeral_key(&self) -> bool {
        self.ephemeral_key.is_some()
    }

    pub fn set_ephemeral_key(&mut self, key: EphemeralKeyPair) {
        self.ephemeral_key = Some(key);
    }

    /// Removes the ephemeral key; it cannot be read again afterwards.
    pub fn take_ephemeral_key(&mut self) -> Option<EphemeralKeyPair> {
        self.ephemeral_key.take()
    }

    pub fn session_key(&self) -> Option<&SharedKey> {
        self.session_key.as_ref()
    }

    pub fn set_session_key(&mut self, key: SharedKey) {
        self.session_key = Some(key);
    }

    pub fn clear(&mut self) {
        self.ephemeral_key = None;
        self.session_key = None;
    }
}
