use serde::{Deserialize, Serialize};

use crate::error::{HandshakeError, Result};

/// Ephemeral public key and its signature over the handshake challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl HandshakeMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            HandshakeMessage::decode(&[0xff, 0x01]),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_keeps_fields() {
        let message = HandshakeMessage {
            public_key: vec![1; 32],
            signature: vec![2; 64],
        };

        let decoded = HandshakeMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
