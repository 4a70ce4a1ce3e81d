//! Client abstractions the node drives
//!
//! The node talks to two kinds of remote parties: the bootstrap server
//! ([`Rendezvous`]) and other overlay members ([`PeerLink`]). Both are
//! traits so the orchestration logic can run against the real UDP/TCP
//! clients in production and against in-memory mocks in tests.

use crate::{proto, Error, NodeId, NodeIdentity, Result, RoutingTableEntry};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Registration against the well-known bootstrap server
pub trait Rendezvous: Send + Sync + 'static {
    /// Register and receive the peers the server hands out (empty for the first node)
    fn register(
        &self,
        identity: &NodeIdentity,
    ) -> impl Future<Output = Result<Vec<SocketAddr>>> + Send;

    /// Remove this node from the server; `Ok(false)` if the server refused
    fn unregister(&self, identity: &NodeIdentity) -> impl Future<Output = Result<bool>> + Send;
}

impl<T: Rendezvous> Rendezvous for Arc<T> {
    fn register(
        &self,
        identity: &NodeIdentity,
    ) -> impl Future<Output = Result<Vec<SocketAddr>>> + Send {
        (**self).register(identity)
    }

    fn unregister(&self, identity: &NodeIdentity) -> impl Future<Output = Result<bool>> + Send {
        (**self).unregister(identity)
    }
}

/// Outbound requests to other overlay members
pub trait PeerLink: Send + Sync + 'static {
    /// Allow outbound requests
    fn start(&self) {}

    /// Refuse further outbound requests
    fn stop(&self) {}

    /// Fetch a peer's routing table; empty on any failure
    fn connect(&self, peer: SocketAddr)
        -> impl Future<Output = HashSet<RoutingTableEntry>> + Send;

    /// Tell a peer that `departing` is leaving the overlay
    fn disconnect(
        &self,
        peer: SocketAddr,
        departing: SocketAddr,
    ) -> impl Future<Output = bool> + Send;

    /// Tell a peer that `joined` is now a member
    fn announce(
        &self,
        peer: SocketAddr,
        joined: RoutingTableEntry,
    ) -> impl Future<Output = bool> + Send;

    /// Probe a peer with our table and receive theirs
    fn ping(
        &self,
        peer: SocketAddr,
        node_id: NodeId,
        entries: Vec<RoutingTableEntry>,
    ) -> impl Future<Output = Result<HashSet<RoutingTableEntry>>> + Send;
}

impl<T: PeerLink> PeerLink for Arc<T> {
    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn connect(
        &self,
        peer: SocketAddr,
    ) -> impl Future<Output = HashSet<RoutingTableEntry>> + Send {
        (**self).connect(peer)
    }

    fn disconnect(
        &self,
        peer: SocketAddr,
        departing: SocketAddr,
    ) -> impl Future<Output = bool> + Send {
        (**self).disconnect(peer, departing)
    }

    fn announce(
        &self,
        peer: SocketAddr,
        joined: RoutingTableEntry,
    ) -> impl Future<Output = bool> + Send {
        (**self).announce(peer, joined)
    }

    fn ping(
        &self,
        peer: SocketAddr,
        node_id: NodeId,
        entries: Vec<RoutingTableEntry>,
    ) -> impl Future<Output = Result<HashSet<RoutingTableEntry>>> + Send {
        (**self).ping(peer, node_id, entries)
    }
}

/// Write one length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &str) -> Result<()> {
    let framed = proto::frame(payload)?;
    stream.write_all(framed.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame from a stream, `None` on a clean EOF
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<String>> {
    let mut prefix = [0u8; 5];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = proto::parse_prefix(&prefix)?;
    let mut body = vec![0u8; len - prefix.len()];
    stream.read_exact(&mut body).await?;

    String::from_utf8(body)
        .map(Some)
        .map_err(|e| Error::Malformed(format!("frame is not UTF-8: {}", e)))
}

pub mod mock {
    //! In-memory bootstrap server and peer links for testing

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// How many registered peers a register reply carries
    pub const PEERS_PER_REPLY: usize = 2;

    /// A bootstrap server living in memory
    ///
    /// Behaves like the real service: hands each new node up to
    /// [`PEERS_PER_REPLY`] already-registered addresses and refuses duplicate
    /// registrations. Share it between nodes through an `Arc`.
    #[derive(Default)]
    pub struct MockRendezvous {
        registry: Mutex<Vec<SocketAddr>>,
        failing: AtomicBool,
        latency: Mutex<Duration>,
        register_calls: AtomicU32,
        unregister_calls: AtomicU32,
    }

    impl MockRendezvous {
        /// Create an empty bootstrap server
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a bootstrap server that already knows some nodes
        pub fn with_peers(peers: Vec<SocketAddr>) -> Self {
            let mock = Self::default();
            *mock.registry.lock() = peers;
            mock
        }

        /// Make every call fail as if all retries timed out
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Delay every register reply by `latency`
        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock() = latency;
        }

        /// Addresses currently registered
        pub fn registered(&self) -> Vec<SocketAddr> {
            self.registry.lock().clone()
        }

        pub fn register_calls(&self) -> u32 {
            self.register_calls.load(Ordering::SeqCst)
        }

        pub fn unregister_calls(&self) -> u32 {
            self.unregister_calls.load(Ordering::SeqCst)
        }

        fn unreachable() -> Error {
            Error::RetriesExhausted {
                attempts: 3,
                last: Box::new(Error::Timeout(Duration::from_millis(5000))),
            }
        }
    }

    impl Rendezvous for MockRendezvous {
        async fn register(&self, identity: &NodeIdentity) -> Result<Vec<SocketAddr>> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Self::unreachable());
            }

            let address = identity.address();
            let mut registry = self.registry.lock();
            if registry.contains(&address) {
                return Err(Error::Rejected {
                    code: proto::status::ALREADY_REGISTERED,
                });
            }

            let peers = registry
                .iter()
                .rev()
                .take(PEERS_PER_REPLY)
                .copied()
                .collect();
            registry.push(address);
            Ok(peers)
        }

        async fn unregister(&self, identity: &NodeIdentity) -> Result<bool> {
            self.unregister_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Self::unreachable());
            }

            let address = identity.address();
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.retain(|a| *a != address);
            Ok(registry.len() != before)
        }
    }

    /// Peer links backed by canned routing tables
    #[derive(Default)]
    pub struct MockPeerLink {
        tables: Mutex<HashMap<SocketAddr, Vec<RoutingTableEntry>>>,
        unreachable: Mutex<HashSet<SocketAddr>>,
        departures: Mutex<Vec<(SocketAddr, SocketAddr)>>,
        announcements: Mutex<Vec<(SocketAddr, RoutingTableEntry)>>,
        pings: Mutex<Vec<SocketAddr>>,
        running: AtomicBool,
    }

    impl MockPeerLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the table `peer` answers with
        pub fn set_table(&self, peer: SocketAddr, entries: Vec<RoutingTableEntry>) {
            self.tables.lock().insert(peer, entries);
        }

        /// Make `peer` time out on every request
        pub fn set_unreachable(&self, peer: SocketAddr, unreachable: bool) {
            let mut set = self.unreachable.lock();
            if unreachable {
                set.insert(peer);
            } else {
                set.remove(&peer);
            }
        }

        /// `(peer, departing)` pairs sent through `disconnect`
        pub fn departures(&self) -> Vec<(SocketAddr, SocketAddr)> {
            self.departures.lock().clone()
        }

        /// `(peer, joined)` pairs sent through `announce`
        pub fn announcements(&self) -> Vec<(SocketAddr, RoutingTableEntry)> {
            self.announcements.lock().clone()
        }

        /// Peers pinged so far, in order
        pub fn pings(&self) -> Vec<SocketAddr> {
            self.pings.lock().clone()
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn reachable(&self, peer: &SocketAddr) -> bool {
            !self.unreachable.lock().contains(peer)
        }
    }

    impl PeerLink for MockPeerLink {
        fn start(&self) {
            self.running.store(true, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        async fn connect(&self, peer: SocketAddr) -> HashSet<RoutingTableEntry> {
            if !self.reachable(&peer) {
                return HashSet::new();
            }
            self.tables
                .lock()
                .get(&peer)
                .map(|entries| entries.iter().copied().collect())
                .unwrap_or_default()
        }

        async fn disconnect(&self, peer: SocketAddr, departing: SocketAddr) -> bool {
            self.departures.lock().push((peer, departing));
            self.reachable(&peer)
        }

        async fn announce(&self, peer: SocketAddr, joined: RoutingTableEntry) -> bool {
            self.announcements.lock().push((peer, joined));
            self.reachable(&peer)
        }

        async fn ping(
            &self,
            peer: SocketAddr,
            _node_id: NodeId,
            _entries: Vec<RoutingTableEntry>,
        ) -> Result<HashSet<RoutingTableEntry>> {
            self.pings.lock().push(peer);
            if !self.reachable(&peer) {
                return Err(Error::Timeout(Duration::from_millis(5000)));
            }
            Ok(self
                .tables
                .lock()
                .get(&peer)
                .map(|entries| entries.iter().copied().collect())
                .unwrap_or_default())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_io_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, "GETRTBL").await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap();
        assert_eq!(first.as_deref(), Some("GETRTBL"));

        // Peer hung up after one frame
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_prefix() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"abcd GETRTBL").await.unwrap();

        assert!(matches!(read_frame(&mut server).await, Err(Error::Malformed(_))));
    }
}
