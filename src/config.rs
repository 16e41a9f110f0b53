use mesh_types::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub handshake: HandshakeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bootstrap_peers: Vec<String>,
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: vec![],
            max_frame_size: mesh_network::codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: mesh_handshake::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut app_config = AppConfig::default();

        if Path::new("config/default.toml").exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name("config/default"))
                .build()
                .map_err(|e| MeshError::ConfigError(format!("Failed to load config file: {}", e)))?;

            app_config = settings
                .try_deserialize::<AppConfig>()
                .map_err(|e| MeshError::ConfigError(format!("Invalid config file: {}", e)))?;
        }

        app_config.override_from(|key| std::env::var(key).ok())?;

        Ok(app_config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    fn override_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen_addr) = lookup("LISTEN_ADDR") {
            self.node.listen_addr = listen_addr;
        }

        if let Some(bootstrap_peers) = lookup("BOOTSTRAP_PEERS") {
            if !bootstrap_peers.is_empty() {
                self.network.bootstrap_peers = bootstrap_peers
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }

        if let Some(max_frame_size) = lookup("MAX_FRAME_SIZE") {
            self.network.max_frame_size = max_frame_size
                .parse()
                .map_err(|e| MeshError::ConfigError(format!("Invalid MAX_FRAME_SIZE: {}", e)))?;
        }

        if let Some(timeout) = lookup("HANDSHAKE_TIMEOUT_SECS") {
            self.handshake.timeout_secs = timeout.parse().map_err(|e| {
                MeshError::ConfigError(format!("Invalid HANDSHAKE_TIMEOUT_SECS: {}", e))
            })?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.listen_addr.is_empty() {
            return Err(MeshError::ConfigError("listen_addr cannot be empty".to_string()));
        }

        self.listen_addr()?;
        self.bootstrap_peers()?;

        if self.handshake.timeout_secs == 0 {
            return Err(MeshError::ConfigError(
                "handshake timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.network.max_frame_size == 0 {
            return Err(MeshError::ConfigError(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.node.listen_addr.parse().map_err(|e| {
            MeshError::ConfigError(format!("Invalid listen address {}: {}", self.node.listen_addr, e))
        })
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<SocketAddr>> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|peer| {
                peer.parse().map_err(|e| {
                    MeshError::ConfigError(format!("Invalid bootstrap peer {}: {}", peer, e))
                })
            })
            .collect()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake.timeout_secs)
    }
}
