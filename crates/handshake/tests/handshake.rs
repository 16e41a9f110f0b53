use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_crypto::EphemeralKeyPair;
use mesh_handshake::{HandshakeConfig, HandshakeMessage, Policy, CHALLENGE};
use mesh_network::{Node, NodeConfig, Peer};
use mesh_types::Opcode;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn node_with_policy(config: HandshakeConfig) -> (Arc<Node>, Policy) {
    let node = Node::new(NodeConfig::default());
    let policy = Policy::new(config);
    node.install_policy(Arc::new(policy.clone()));
    (node, policy)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_both_sides_derive_the_same_key() {
    let (a, policy_a) = node_with_policy(HandshakeConfig::default());
    let (b, policy_b) = node_with_policy(HandshakeConfig::default());

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for policy in [&policy_a, &policy_b] {
        let done_tx = done_tx.clone();
        policy.on_handshake_complete().register(move |peer: &Arc<Peer>| {
            done_tx.send(peer.id()).ok();
            Ok(())
        });
    }

    let (left, right) = tokio::io::duplex(64 * 1024);
    let b_on_a = a.attach(left, addr());
    let a_on_b = b.attach(right, addr());

    for _ in 0..2 {
        tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
    }

    let key_a = b_on_a.session_key().expect("A has a session key");
    let key_b = a_on_b.session_key().expect("B has a session key");
    assert_eq!(key_a, key_b);

    for peer in [&b_on_a, &a_on_b] {
        assert!(!peer.has_ephemeral_key());
        assert!(!peer.is_closed());
        assert!(peer.on_message(Opcode::HANDSHAKE).is_empty());
    }
}

#[tokio::test]
async fn test_handshake_over_tcp() {
    let (server, _) = node_with_policy(HandshakeConfig::default());
    let (client, _) = node_with_policy(HandshakeConfig::default());

    let bound = server.listen(addr()).await.unwrap();
    let server_peer = client.dial(bound).await.unwrap();

    wait_for(|| server_peer.session_key().is_some()).await;
    wait_for(|| {
        let peers = server.peers();
        peers.len() == 1 && peers[0].session_key().is_some()
    })
    .await;

    let client_peer = server.peers().pop().unwrap();
    assert_eq!(server_peer.session_key(), client_peer.session_key());

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (a, _) = node_with_policy(HandshakeConfig {
        timeout: Duration::from_millis(100),
    });
    // A plain node without the policy never answers.
    let b = Node::new(NodeConfig::default());

    let (left, right) = tokio::io::duplex(64 * 1024);
    let b_on_a = a.attach(left, addr());
    let a_on_b = b.attach(right, addr());

    wait_for(|| b_on_a.is_closed()).await;
    assert!(b_on_a.session_key().is_none());
    wait_for(|| !b_on_a.has_ephemeral_key()).await;

    wait_for(|| a_on_b.is_closed()).await;
    wait_for(|| a.peers().is_empty()).await;
}

#[tokio::test]
async fn test_replayed_response_is_ignored() {
    let (a, policy_a) = node_with_policy(HandshakeConfig::default());

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    policy_a.on_handshake_complete().register(move |_: &Arc<Peer>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    // B is driven by hand so it can replay its response.
    let b = Node::new(NodeConfig::default());
    let (left, right) = tokio::io::duplex(64 * 1024);
    let b_on_a = a.attach(left, addr());
    let a_on_b = b.attach(right, addr());

    let theirs = EphemeralKeyPair::generate();
    let response = HandshakeMessage {
        public_key: theirs.public_key(),
        signature: theirs.sign(CHALLENGE),
    }
    .encode()
    .unwrap();

    a_on_b.send(Opcode::HANDSHAKE, response.clone()).unwrap();
    wait_for(|| b_on_a.session_key().is_some()).await;
    let key = b_on_a.session_key();

    a_on_b.send(Opcode::HANDSHAKE, response).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(b_on_a.session_key(), key);
    assert!(b_on_a.on_message(Opcode::HANDSHAKE).is_empty());
    assert!(!b_on_a.is_closed());
}

#[tokio::test]
async fn test_disconnect_clears_session() {
    let (a, _) = node_with_policy(HandshakeConfig::default());
    let (b, _) = node_with_policy(HandshakeConfig::default());

    let (left, right) = tokio::io::duplex(64 * 1024);
    let b_on_a = a.attach(left, addr());
    let a_on_b = b.attach(right, addr());

    wait_for(|| b_on_a.session_key().is_some() && a_on_b.session_key().is_some()).await;

    a_on_b.disconnect();

    wait_for(|| b_on_a.is_closed() && b_on_a.session_key().is_none()).await;
    wait_for(|| a_on_b.session_key().is_none()).await;
    wait_for(|| a.peers().is_empty() && b.peers().is_empty()).await;
}
