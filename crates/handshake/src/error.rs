use mesh_callbacks::CallbackError;
use mesh_crypto::CryptoError;
use mesh_types::{MeshError, PeerId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("{peer_id} sent a handshake message but no handshake is in flight")]
    NotInitiated { peer_id: PeerId },

    #[error("{peer_id} attempted to start a second handshake")]
    AlreadyInitiated { peer_id: PeerId },

    #[error("Malformed handshake message: {0}")]
    Malformed(String),

    #[error("Failed to verify handshake signature: {0}")]
    InvalidSignature(#[source] CryptoError),

    #[error("Failed to derive shared key: {0}")]
    Derivation(#[source] CryptoError),

    #[error("Failed to send handshake message: {0}")]
    Send(#[source] MeshError),

    #[error("Failed to clear handshake timeout: {0}")]
    Timeout(#[source] MeshError),
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

impl From<HandshakeError> for CallbackError {
    fn from(err: HandshakeError) -> Self {
        CallbackError::failed(err)
    }
}
