use std::sync::Arc;
use std::time::Duration;

use mesh_callbacks::{CallbackResult, SequentialCallbackManager, DEREGISTER_CALLBACK};
use mesh_crypto::{verify_signature, EphemeralKeyPair};
use mesh_network::{timeout, HandshakePolicy, Node, Peer};
use mesh_types::{Message, Opcode};
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, Result};
use crate::message::HandshakeMessage;

/// Fixed string both sides sign with their ephemeral key.
pub const CHALLENGE: &[u8] = b".noise_handshake";

/// Timer key the handshake arms on every peer it initiates with.
pub const TIMEOUT_KEY: &str = "handshake";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long to wait for the peer's key before disconnecting.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Authenticated ephemeral Diffie-Hellman handshake.
///
/// Both sides start on connect: each generates an ephemeral key pair, signs
/// [`CHALLENGE`], sends the public key and signature, and arms a timeout.
/// The first valid reply derives the session key, consumes the ephemeral
/// key, cancels the timeout and deregisters the handler for that peer. Any
/// failure disconnects the peer.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    config: HandshakeConfig,
    on_handshake_complete: SequentialCallbackManager<Arc<Peer>>,
}

impl Policy {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            on_handshake_complete: SequentialCallbackManager::new(),
        }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Runs once per peer after its session key has been installed.
    pub fn on_handshake_complete(&self) -> &SequentialCallbackManager<Arc<Peer>> {
        &self.on_handshake_complete
    }

    /// Send our ephemeral key to `peer` and wait for theirs.
    ///
    /// Starting a second handshake while one is pending disconnects the peer.
    pub fn initiate(&self, peer: &Arc<Peer>) -> Result<()> {
        let result = self.try_initiate(peer);
        if result.is_err() {
            peer.disconnect();
        }
        result
    }

    fn try_initiate(&self, peer: &Arc<Peer>) -> Result<()> {
        let keys = EphemeralKeyPair::generate();
        let payload = HandshakeMessage {
            public_key: keys.public_key(),
            signature: keys.sign(CHALLENGE),
        }
        .encode()?;

        peer.with_session(|session| {
            if session.has_ephemeral_key() {
                return Err(HandshakeError::AlreadyInitiated { peer_id: peer.id() });
            }
            session.set_ephemeral_key(keys);
            Ok(())
        })?;

        peer.on_disconnect().register(|peer: &Arc<Peer>| {
            peer.with_session(|session| session.clear());
            Err(DEREGISTER_CALLBACK)
        });

        timeout::enforce(peer, TIMEOUT_KEY, self.config.timeout, |peer| {
            peer.disconnect()
        });

        peer.send(Opcode::HANDSHAKE, payload)
            .map_err(HandshakeError::Send)?;

        debug!("Sent ephemeral key to {}", peer.id());
        Ok(())
    }

    fn complete(&self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let message = HandshakeMessage::decode(&message.payload)?;

        verify_signature(&message.public_key, CHALLENGE, &message.signature)
            .map_err(HandshakeError::InvalidSignature)?;

        // Consuming the ephemeral key and installing the session key happen
        // under one session lock.
        let fingerprint = peer.with_session(|session| {
            let keys = session
                .take_ephemeral_key()
                .ok_or(HandshakeError::NotInitiated { peer_id: peer.id() })?;
            let shared = keys
                .derive_shared_key(&message.public_key)
                .map_err(HandshakeError::Derivation)?;
            let fingerprint = shared.fingerprint();
            session.set_session_key(shared);
            Ok::<_, HandshakeError>(fingerprint)
        })?;

        timeout::clear(peer, TIMEOUT_KEY).map_err(HandshakeError::Timeout)?;

        info!(
            "Handshake with {} complete, session key fingerprint {}",
            peer.id(),
            fingerprint
        );

        for err in self.on_handshake_complete.run(peer) {
            warn!("Handshake completion callback failed for {}: {}", peer.id(), err);
        }
        self.on_handshake_complete.trim();

        Ok(())
    }
}

impl HandshakePolicy for Policy {
    fn installed_opcodes(&self) -> Vec<Opcode> {
        vec![Opcode::HANDSHAKE]
    }

    fn on_policy_installed(&self, node: &Arc<Node>) {
        let policy = self.clone();
        node.on_peer_connected().register(move |peer: &Arc<Peer>| {
            if let Err(e) = policy.initiate(peer) {
                warn!("Failed to start handshake with {}: {}", peer.id(), e);
            }
            // Stay registered for the next peer.
            Ok(())
        });
    }

    fn on_message(&self, peer: &Arc<Peer>, message: &Message) -> CallbackResult {
        match self.complete(peer, message) {
            Ok(()) => Err(DEREGISTER_CALLBACK),
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer.id(), e);
                peer.with_session(|session| session.clear());
                peer.disconnect();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_network::codec::{self, DEFAULT_MAX_FRAME_SIZE};
    use mesh_network::NodeConfig;
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(2);

    /// A node running the policy, connected to a raw stream the test drives.
    fn setup(config: HandshakeConfig) -> (Arc<Node>, Arc<Peer>, DuplexStream) {
        let node = Node::new(NodeConfig::default());
        node.install_policy(Arc::new(Policy::new(config)));

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let peer = node.attach(ours, "127.0.0.1:0".parse().unwrap());
        (node, peer, theirs)
    }

    async fn read_handshake(stream: &mut DuplexStream) -> HandshakeMessage {
        let frame = tokio::time::timeout(WAIT, codec::read_frame(stream, DEFAULT_MAX_FRAME_SIZE))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, Opcode::HANDSHAKE);
        HandshakeMessage::decode(&frame.payload).unwrap()
    }

    async fn send_payload(stream: &mut DuplexStream, payload: Vec<u8>) {
        let frame = Message::new(Opcode::HANDSHAKE, payload);
        codec::write_frame(stream, &frame, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
    }

    async fn wait_closed(peer: &Peer) {
        tokio::time::timeout(WAIT, async {
            while !peer.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer should be disconnected");
    }

    #[tokio::test]
    async fn test_initiates_on_connect() {
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());

        let message = read_handshake(&mut remote).await;
        verify_signature(&message.public_key, CHALLENGE, &message.signature).unwrap();

        assert!(peer.has_ephemeral_key());
        assert!(timeout::is_armed(&peer, TIMEOUT_KEY));
    }

    #[tokio::test]
    async fn test_valid_reply_installs_session_key() {
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());
        let ours = read_handshake(&mut remote).await;

        let theirs = EphemeralKeyPair::generate();
        let reply = HandshakeMessage {
            public_key: theirs.public_key(),
            signature: theirs.sign(CHALLENGE),
        };
        send_payload(&mut remote, reply.encode().unwrap()).await;

        let expected = theirs.derive_shared_key(&ours.public_key).unwrap();
        tokio::time::timeout(WAIT, async {
            while peer.session_key().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(peer.session_key().unwrap(), expected);
        assert!(!peer.has_ephemeral_key());
        assert!(!timeout::is_armed(&peer, TIMEOUT_KEY));
        assert!(peer.on_message(Opcode::HANDSHAKE).is_empty());
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_bad_signature_disconnects() {
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());
        read_handshake(&mut remote).await;

        let theirs = EphemeralKeyPair::generate();
        let reply = HandshakeMessage {
            public_key: theirs.public_key(),
            signature: theirs.sign(b"something else"),
        };
        send_payload(&mut remote, reply.encode().unwrap()).await;

        wait_closed(&peer).await;
        assert!(peer.session_key().is_none());
        assert!(!peer.has_ephemeral_key());
    }

    #[tokio::test]
    async fn test_malformed_message_disconnects() {
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());
        read_handshake(&mut remote).await;

        send_payload(&mut remote, vec![0xde, 0xad]).await;

        wait_closed(&peer).await;
        assert!(peer.session_key().is_none());
    }

    #[tokio::test]
    async fn test_second_initiation_disconnects() {
        let policy = Policy::default();
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());
        read_handshake(&mut remote).await;

        let err = policy.initiate(&peer).unwrap_err();
        assert!(matches!(err, HandshakeError::AlreadyInitiated { .. }));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_message_without_pending_handshake_disconnects() {
        let (_node, peer, mut remote) = setup(HandshakeConfig::default());
        read_handshake(&mut remote).await;

        // Drop the pending key so the peer is back to idle.
        peer.with_session(|session| session.clear());

        let theirs = EphemeralKeyPair::generate();
        let reply = HandshakeMessage {
            public_key: theirs.public_key(),
            signature: theirs.sign(CHALLENGE),
        };
        send_payload(&mut remote, reply.encode().unwrap()).await;

        wait_closed(&peer).await;
        assert!(peer.session_key().is_none());
    }

    #[tokio::test]
    async fn test_timeout_disconnects() {
        let config = HandshakeConfig {
            timeout: Duration::from_millis(50),
        };
        let (_node, peer, mut remote) = setup(config);
        read_handshake(&mut remote).await;

        wait_closed(&peer).await;
        assert!(peer.session_key().is_none());
        assert!(!timeout::is_armed(&peer, TIMEOUT_KEY));
    }
}
