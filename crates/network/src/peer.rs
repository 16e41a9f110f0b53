use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use mesh_callbacks::SequentialCallbackManager;
use mesh_crypto::SharedKey;
use mesh_types::{Message, MeshError, Opcode, PeerId, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::PeerSession;
use crate::timeout::Timer;

/// An inbound message together with the peer it came from.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub peer: Arc<Peer>,
    pub message: Message,
}

/// One live connection.
///
/// Owned by the node's peer table; handlers receive it as `Arc<Peer>`.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    session: Mutex<PeerSession>,
    pub(crate) timeouts: Mutex<HashMap<&'static str, Timer>>,
    handlers: Mutex<HashMap<Opcode, SequentialCallbackManager<Delivery>>>,
    on_disconnect: SequentialCallbackManager<Arc<Peer>>,
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            shutdown: CancellationToken::new(),
            session: Mutex::new(PeerSession::default()),
            timeouts: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            on_disconnect: SequentialCallbackManager::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a message for ordered delivery to this peer.
    pub fn send(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::PeerClosed { peer_id: self.id });
        }

        self.outbound
            .send(Message::new(opcode, payload))
            .map_err(|_| MeshError::PeerClosed { peer_id: self.id })
    }

    /// Terminate the connection. Idempotent.
    pub fn disconnect(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Disconnect requested for {}", self.id);
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `f` with exclusive access to the handshake session state.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut PeerSession) -> R) -> R {
        let mut session = self.session.lock();
        f(&mut session)
    }

    pub fn has_ephemeral_key(&self) -> bool {
        self.with_session(|session| session.has_ephemeral_key())
    }

    pub fn session_key(&self) -> Option<SharedKey> {
        self.with_session(|session| session.session_key().cloned())
    }

    /// Per-peer handler registry for `opcode`, created on first use.
    pub fn on_message(&self, opcode: Opcode) -> SequentialCallbackManager<Delivery> {
        self.handlers.lock().entry(opcode).or_default().clone()
    }

    pub(crate) fn handlers_for(&self, opcode: Opcode) -> Option<SequentialCallbackManager<Delivery>> {
        self.handlers.lock().get(&opcode).cloned()
    }

    /// Callbacks run once when this peer's connection is torn down.
    pub fn on_disconnect(&self) -> &SequentialCallbackManager<Arc<Peer>> {
        &self.on_disconnect
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
