//! Node configuration

use ringnet_core::RetryPolicy;
use ringnet_dht::{DhtError, IdSpace};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's advertised identity
    pub node: NodeConfig,

    /// Bootstrap server configuration
    pub bootstrap: BootstrapConfig,

    /// Peer-to-peer client configuration
    pub peer: PeerConfig,

    /// Identifier ring configuration
    pub id_space: IdSpaceConfig,

    /// Periodic synchronization configuration
    pub maintenance: MaintenanceConfig,

    /// Shutdown configuration
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// IP address advertised to the bootstrap server and peers
    pub ip: IpAddr,
    /// Port the peer server listens on (0 picks a free one)
    pub port: u16,
    /// Bootstrap username, random when unset
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Address of the bootstrap server
    pub address: SocketAddr,
    /// Attempts per register/unregister call
    pub retries: u32,
    /// Per-attempt reply timeout in milliseconds
    pub timeout_ms: u64,
    /// Pause between attempts in milliseconds
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Timeout for one request/response exchange with a peer in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdSpaceConfig {
    /// Identifiers live in `[1, address_space_size]`
    pub address_space_size: u32,
    /// Identifiers per coarse class
    pub addresses_per_character: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Delay before the first synchronization round in milliseconds
    pub initial_delay_ms: u64,
    /// Interval between rounds in milliseconds
    pub period_ms: u64,
    /// How many ring predecessors each round contacts
    pub predecessors: usize,
    /// Consecutive failed rounds before a member is evicted
    pub suspicion_threshold: u32,
    /// Background worker slots
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long background tasks get to finish in milliseconds
    pub grace_period_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5000,
            username: None,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 55555),
            retries: 3,
            timeout_ms: 5000,
            backoff_ms: 0,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
        }
    }
}

impl Default for IdSpaceConfig {
    fn default() -> Self {
        let space = IdSpace::default();
        Self {
            address_space_size: space.address_space_size,
            addresses_per_character: space.addresses_per_character,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 30_000,
            period_ms: 20_000,
            predecessors: 2,
            suspicion_threshold: 3,
            workers: 2,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validated identifier space
    pub fn id_space(&self) -> Result<IdSpace, DhtError> {
        IdSpace::new(
            self.id_space.address_space_size,
            self.id_space.addresses_per_character,
        )
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }
}

impl BootstrapConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.backoff_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PeerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl MaintenanceConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}
