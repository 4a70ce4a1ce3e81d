//! Core data types for ringnet

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A position on the identifier ring, `1..=ADDRESS_SPACE_SIZE` once assigned
pub type NodeId = u32;

/// One member of the overlay as seen from the local routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingTableEntry {
    /// Address the member's peer server listens on
    pub address: SocketAddr,
    /// The member's ring identifier
    pub node_id: NodeId,
}

impl RoutingTableEntry {
    pub fn new(address: SocketAddr, node_id: NodeId) -> Self {
        Self { address, node_id }
    }
}

impl fmt::Display for RoutingTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address)
    }
}

/// Who this node is on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Advertised IP address
    pub ip: IpAddr,
    /// Advertised peer server port
    pub port: u16,
    /// Name registered with the bootstrap server
    pub username: String,
    /// Ring identifier, unassigned until the join completes
    pub node_id: Option<NodeId>,
}

impl NodeIdentity {
    pub fn new(ip: IpAddr, port: u16, username: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            username: username.into(),
            node_id: None,
        }
    }

    /// The socket address other peers reach us on
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Routing entry for this node, once an identifier has been assigned
    pub fn entry(&self) -> Option<RoutingTableEntry> {
        self.node_id
            .map(|node_id| RoutingTableEntry::new(self.address(), node_id))
    }
}

/// Generate a random 16-hex-digit username for bootstrap registration
pub fn random_username() -> String {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        // Fall back to the clock; uniqueness only matters per bootstrap server
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        buf = ts.to_le_bytes();
    }
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_entry_requires_node_id() {
        let mut identity = NodeIdentity::new("127.0.0.1".parse().unwrap(), 5000, "alice");
        assert!(identity.entry().is_none());

        identity.node_id = Some(7);
        let entry = identity.entry().unwrap();
        assert_eq!(entry.address, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(entry.node_id, 7);
    }

    #[test]
    fn test_random_username() {
        let a = random_username();
        let b = random_username();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = RoutingTableEntry::new("10.0.0.1:4000".parse().unwrap(), 12);
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"address":"10.0.0.1:4000","node_id":12}"#);
    }
}
