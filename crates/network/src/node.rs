use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_callbacks::{CallbackResult, ReduceCallbackManager, SequentialCallbackManager};
use mesh_types::{Message, MeshError, Opcode, PeerId, Result};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::peer::{Delivery, Peer};
use crate::policy::HandshakePolicy;
use crate::timeout;

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type MessageHandler = Arc<dyn Fn(&Arc<Peer>, &Message) -> CallbackResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Owns peer connections and routes their events into callback registries.
pub struct Node {
    config: NodeConfig,
    next_peer_id: AtomicU64,
    shutdown: CancellationToken,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    handlers: RwLock<HashMap<Opcode, Vec<MessageHandler>>>,
    on_peer_connected: SequentialCallbackManager<Arc<Peer>>,
    on_peer_disconnected: SequentialCallbackManager<Arc<Peer>>,
    inbound: ReduceCallbackManager<Message, Arc<Peer>>,
    outbound: ReduceCallbackManager<Message, Arc<Peer>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_peer_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            peers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            on_peer_connected: SequentialCallbackManager::new(),
            on_peer_disconnected: SequentialCallbackManager::new(),
            inbound: ReduceCallbackManager::new(),
            outbound: ReduceCallbackManager::reversed(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Runs for every new peer before its first inbound message is read.
    pub fn on_peer_connected(&self) -> &SequentialCallbackManager<Arc<Peer>> {
        &self.on_peer_connected
    }

    pub fn on_peer_disconnected(&self) -> &SequentialCallbackManager<Arc<Peer>> {
        &self.on_peer_disconnected
    }

    /// Transforms every inbound message before handler dispatch.
    pub fn inbound_middleware(&self) -> &ReduceCallbackManager<Message, Arc<Peer>> {
        &self.inbound
    }

    /// Transforms every outbound message before it is framed. Runs in
    /// reverse registration order, mirroring the inbound pipeline.
    pub fn outbound_middleware(&self) -> &ReduceCallbackManager<Message, Arc<Peer>> {
        &self.outbound
    }

    /// Register a handler for `opcode`.
    ///
    /// Every peer gets its own copy, so a handler that deregisters itself
    /// stops receiving messages from that peer only.
    pub fn register_opcode_handler<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(&Arc<Peer>, &Message) -> CallbackResult + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);

        let mut handlers = self.handlers.write();
        handlers.entry(opcode).or_default().push(Arc::clone(&handler));

        for peer in self.peers.read().values() {
            register_on_peer(peer, opcode, Arc::clone(&handler));
        }
    }

    pub fn install_policy(self: &Arc<Self>, policy: Arc<dyn HandshakePolicy>) {
        let opcodes = policy.installed_opcodes();

        for opcode in &opcodes {
            let policy = Arc::clone(&policy);
            self.register_opcode_handler(*opcode, move |peer, message| {
                policy.on_message(peer, message)
            });
        }

        policy.on_policy_installed(self);
        info!("Installed handshake policy for opcodes {:?}", opcodes);
    }

    /// Bind `addr` and accept connections until [`shutdown`](Self::shutdown).
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::NetworkError(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!("Listening on {}", local_addr);

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => {
                        info!("Listener on {} stopped", local_addr);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer_addr)) => {
                            socket.set_nodelay(true).ok();
                            node.attach(socket, peer_addr);
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Peer>> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::NetworkError(format!("Failed to dial {}: {}", addr, e)))?;
        socket.set_nodelay(true).ok();

        info!("Dialed {}", addr);

        Ok(self.attach(socket, addr))
    }

    /// Adopt an established stream as a peer connection.
    ///
    /// Connect callbacks run before this returns; the connection task is
    /// spawned afterwards, so must be called from within a tokio runtime.
    pub fn attach<S>(self: &Arc<Self>, stream: S, addr: SocketAddr) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer::new(id, addr, outbound_tx));

        {
            let handlers = self.handlers.read();
            for (opcode, list) in handlers.iter() {
                for handler in list {
                    register_on_peer(&peer, *opcode, Arc::clone(handler));
                }
            }
            self.peers.write().insert(id, Arc::clone(&peer));
        }

        info!("Peer {} connected at {}", id, addr);

        for err in self.on_peer_connected.run(&peer) {
            warn!("Peer connect callback failed for {}: {}", id, err);
        }
        self.on_peer_connected.trim();

        tokio::spawn(Arc::clone(self).run_connection(Arc::clone(&peer), stream, outbound_rx));

        peer
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    /// Stop listening and disconnect every peer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for peer in self.peers() {
            peer.disconnect();
        }
    }

    async fn run_connection<S>(
        self: Arc<Self>,
        peer: Arc<Peer>,
        stream: S,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let shutdown = peer.shutdown_token();
        let max_frame_size = self.config.max_frame_size;

        let writer_node = Arc::clone(&self);
        let writer_peer = Arc::clone(&peer);
        let writer_shutdown = shutdown.clone();
        let mut writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Flush whatever is queued before honouring shutdown.
                    biased;
                    next = outbound_rx.recv() => {
                        let Some(message) = next else { break };
                        let message = writer_node.apply_outbound(&writer_peer, message);
                        if let Err(e) = codec::write_frame(&mut writer, &message, max_frame_size).await {
                            warn!("Failed to write to {}: {}", writer_peer.id(), e);
                            break;
                        }
                    }
                    _ = writer_shutdown.cancelled() => break,
                }
            }
            writer_peer.disconnect();
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Connection to {} shut down locally", peer.id());
                    break;
                }
                frame = codec::read_frame(&mut reader, max_frame_size) => match frame {
                    Ok(Some(message)) => self.dispatch(&peer, message),
                    Ok(None) => {
                        info!("Connection closed by {}", peer.id());
                        break;
                    }
                    Err(e) => {
                        warn!("Connection error with {}: {}", peer.id(), e);
                        break;
                    }
                }
            }
        }

        peer.disconnect();
        self.teardown(&peer);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            warn!("Writer for {} did not drain in time", peer.id());
            writer_task.abort();
        }
    }

    fn dispatch(&self, peer: &Arc<Peer>, message: Message) {
        let (message, errors) = self.inbound.run(message, peer);
        for err in errors {
            warn!("Inbound middleware failed for {}: {}", peer.id(), err);
        }

        let opcode = message.opcode;
        let Some(handlers) = peer.handlers_for(opcode).filter(|h| !h.is_empty()) else {
            debug!("No live handler for opcode {} from {}, dropping", opcode, peer.id());
            return;
        };

        let delivery = Delivery {
            peer: Arc::clone(peer),
            message,
        };
        for err in handlers.run(&delivery) {
            warn!("Handler for opcode {} failed for {}: {}", opcode, peer.id(), err);
        }
        handlers.trim();
    }

    fn apply_outbound(&self, peer: &Arc<Peer>, message: Message) -> Message {
        let (message, errors) = self.outbound.run(message, peer);
        for err in errors {
            warn!("Outbound middleware failed for {}: {}", peer.id(), err);
        }
        message
    }

    fn teardown(&self, peer: &Arc<Peer>) {
        timeout::clear_all(peer);

        for err in peer.on_disconnect().run(peer) {
            warn!("Peer disconnect callback failed for {}: {}", peer.id(), err);
        }
        for err in self.on_peer_disconnected.run(peer) {
            warn!("Node disconnect callback failed for {}: {}", peer.id(), err);
        }
        self.on_peer_disconnected.trim();

        self.peers.write().remove(&peer.id());
        info!("Peer {} disconnected", peer.id());
    }
}

fn register_on_peer(peer: &Peer, opcode: Opcode, handler: MessageHandler) {
    peer.on_message(opcode)
        .register(move |delivery: &Delivery| handler(&delivery.peer, &delivery.message));
}
