use crate::config::AppConfig;
use mesh_handshake::{HandshakeConfig, Policy};
use mesh_network::{Node, NodeConfig, Peer};
use mesh_types::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MeshApp {
    config: AppConfig,
    node: Arc<Node>,
}

impl MeshApp {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        info!("Initializing handshake mesh node");
        info!("Listen address: {}", config.node.listen_addr);
        info!("Handshake timeout: {:?}", config.handshake_timeout());

        let node = Node::new(NodeConfig {
            max_frame_size: config.network.max_frame_size,
        });

        let policy = Policy::new(HandshakeConfig {
            timeout: config.handshake_timeout(),
        });
        policy.on_handshake_complete().register(|peer: &Arc<Peer>| {
            if let Some(key) = peer.session_key() {
                info!("Secure session with {} ({}) established: {}", peer.id(), peer.addr(), key.fingerprint());
            }
            Ok(())
        });
        node.install_policy(Arc::new(policy));

        node.on_peer_disconnected().register(|peer: &Arc<Peer>| {
            info!("Peer {} ({}) left", peer.id(), peer.addr());
            Ok(())
        });

        Ok(Self { config, node })
    }

    pub async fn run(self) -> Result<()> {
        let listen_addr = self.node.listen(self.config.listen_addr()?).await?;
        info!("Node listening on {}", listen_addr);

        for addr in self.config.bootstrap_peers()? {
            info!("Connecting to bootstrap peer: {}", addr);
            if let Err(e) = self.node.dial(addr).await {
                warn!("Failed to connect to bootstrap peer {}: {}", addr, e);
            }
        }

        tokio::signal::ctrl_c().await?;

        info!("Shutting down, {} peers connected", self.node.peers().len());
        self.node.shutdown();

        Ok(())
    }
}
