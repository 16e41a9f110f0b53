use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const SHARED_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key: not a usable Edwards point")]
    InvalidPublicKey,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Single-use Ed25519 key pair for one handshake.
///
/// The private half doubles as the Diffie-Hellman scalar, so the public key
/// that authenticates the handshake is the same point the peer multiplies.
pub struct EphemeralKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    /// Multiply the peer's ephemeral public point by our private scalar.
    pub fn derive_shared_key(&self, peer_public_key: &[u8]) -> Result<SharedKey> {
        let bytes: [u8; PUBLIC_KEY_LEN] =
            peer_public_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LEN,
                    actual: peer_public_key.len(),
                })?;

        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or(CryptoError::InvalidPublicKey)?;

        // A small-order point would force a predictable shared secret.
        if point.is_small_order() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let shared = self.signing_key.to_scalar() * point;

        Ok(SharedKey(shared.compress().to_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &hex::encode(self.verifying_key.to_bytes()))
            .finish_non_exhaustive()
    }
}

/// Symmetric session key negotiated with one peer.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.0
    }

    /// Short, non-reversible identifier safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&hash_data(&self.0)[..8])
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_LEN,
            actual: public_key.len(),
        });
    }

    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }

    let verifying_key = VerifyingKey::from_bytes(
        public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?,
    )
    .map_err(|_| CryptoError::InvalidPublicKey)?;

    let signature = Signature::from_bytes(
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?,
    );

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn hash_data(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
