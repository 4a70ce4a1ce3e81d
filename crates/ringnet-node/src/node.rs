//! Overlay node orchestration
//!
//! A [`Node`] owns the routing table and drives the join/leave lifecycle:
//! register with the bootstrap server, pull routing tables from the peers
//! it hands out, pick a ring identifier, and keep the table fresh in the
//! background until it is stopped.

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::maintenance::{Maintenance, RoundReport};
use crate::server::{NodeServer, ServerContext};
use crate::state::{NodeState, StateMachine};
use crate::tasks::TaskPool;
use parking_lot::{Mutex, RwLock};
use ringnet_core::{random_username, NodeId, NodeIdentity, PeerLink, Rendezvous, RoutingTableEntry};
use ringnet_dht::{select_node_id, IdSpace, RoutingTable};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Node<R, P> {
    config: Config,
    space: IdSpace,
    identity: Arc<RwLock<NodeIdentity>>,
    state: Arc<StateMachine>,
    table: Arc<RoutingTable>,
    bootstrap: R,
    peers: Arc<P>,
    server: NodeServer,
    starting: AtomicBool,
    tasks: Mutex<Option<TaskPool>>,
    maintenance: Mutex<Option<Arc<Maintenance<Arc<P>>>>>,
}

/// Clears the `starting` flag however `start` exits
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: Rendezvous, P: PeerLink> Node<R, P> {
    pub fn new(config: Config, bootstrap: R, peers: P) -> Result<Self> {
        let space = config.id_space()?;
        let username = config
            .node
            .username
            .clone()
            .unwrap_or_else(random_username);
        let identity = NodeIdentity::new(config.node.ip, config.node.port, username);
        let server = NodeServer::new(config.peer.request_timeout());
        Ok(Self {
            config,
            space,
            identity: Arc::new(RwLock::new(identity)),
            state: Arc::new(StateMachine::new()),
            table: Arc::new(RoutingTable::new()),
            bootstrap,
            peers: Arc::new(peers),
            server,
            starting: AtomicBool::new(false),
            tasks: Mutex::new(None),
            maintenance: Mutex::new(None),
        })
    }

    pub fn state(&self) -> NodeState {
        self.state.current()
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.identity.read().node_id
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity.read().clone()
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn peers(&self) -> &Arc<P> {
        &self.peers
    }

    /// Address the peer server is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Join the overlay
    ///
    /// On failure the node is left in whatever state it reached; call
    /// [`stop`](Self::stop) to release what was started. Only one `start`
    /// runs at a time, a concurrent call fails with
    /// [`NodeError::StartInProgress`].
    pub async fn start(&self) -> Result<()> {
        if self.starting.swap(true, Ordering::SeqCst) {
            return Err(NodeError::StartInProgress);
        }
        let _guard = StartGuard(&self.starting);

        let current = self.state.current();
        if current != NodeState::Idle {
            return Err(NodeError::InvalidTransition {
                from: current,
                to: NodeState::Registered,
            });
        }

        *self.tasks.lock() = Some(TaskPool::new(self.config.maintenance.workers));

        let ctx = ServerContext {
            table: Arc::clone(&self.table),
            state: Arc::clone(&self.state),
            identity: Arc::clone(&self.identity),
        };
        let bind = self.identity.read().address();
        let bound = self.server.start(bind, ctx).await?;
        {
            let mut identity = self.identity.write();
            if identity.port == 0 {
                identity.port = bound.port();
            }
        }
        self.peers.start();

        let peers = self.register().await?;
        let collected = self.connect(&peers).await;
        if !peers.is_empty() && collected.is_empty() {
            return Err(NodeError::JoinFailed(format!(
                "no routing table collected from {} peers",
                peers.len()
            )));
        }

        let merged = self.update_routing_table(collected);
        let local = self.assign_node_id()?;
        self.table.add_entry(local);
        self.state.advance(NodeState::Connected)?;
        tracing::info!(
            "Joined overlay as {} with {} members ({} learned from peers)",
            local,
            self.table.len(),
            merged
        );

        self.spawn_background(local);
        Ok(())
    }

    async fn register(&self) -> Result<Vec<SocketAddr>> {
        let identity = self.identity();
        let mut peers = self
            .bootstrap
            .register(&identity)
            .await
            .map_err(NodeError::Registration)?;
        peers.retain(|peer| *peer != identity.address());

        self.state.advance(NodeState::Registered)?;
        tracing::info!(
            "Registered {} as {} ({} candidate peers)",
            identity.address(),
            identity.username,
            peers.len()
        );
        Ok(peers)
    }

    /// Pull every candidate's routing table; any empty answer voids the round
    async fn connect(&self, peers: &[SocketAddr]) -> HashSet<RoutingTableEntry> {
        let mut collected = HashSet::new();
        for &peer in peers {
            let entries = self.peers.connect(peer).await;
            if entries.is_empty() {
                tracing::warn!("Peer {} returned no routing table, discarding join round", peer);
                return HashSet::new();
            }
            tracing::debug!("Peer {} returned {} entries", peer, entries.len());
            collected.extend(entries);
        }
        collected
    }

    /// Pick (or keep) this node's identifier and return its routing entry
    fn assign_node_id(&self) -> Result<RoutingTableEntry> {
        let mut identity = self.identity.write();
        let node_id = match identity.node_id {
            Some(node_id) => {
                let class = self.space.class_of(node_id);
                let taken = self
                    .table
                    .entries()
                    .iter()
                    .any(|e| e.address != identity.address() && self.space.class_of(e.node_id) == class);
                if taken {
                    tracing::warn!("Keeping node id {} although its class is already in use", node_id);
                }
                node_id
            }
            None => select_node_id(&self.table, &self.space, &mut rand::thread_rng())?,
        };
        identity.node_id = Some(node_id);
        Ok(RoutingTableEntry::new(identity.address(), node_id))
    }

    fn spawn_background(&self, local: RoutingTableEntry) {
        let maintenance = Arc::new(Maintenance::new(
            Arc::clone(&self.table),
            Arc::clone(&self.peers),
            local,
            &self.config.maintenance,
        ));
        *self.maintenance.lock() = Some(Arc::clone(&maintenance));

        let members: Vec<SocketAddr> = self
            .table
            .sorted_entries()
            .into_iter()
            .map(|e| e.address)
            .filter(|address| *address != local.address)
            .collect();
        let peers = Arc::clone(&self.peers);

        let mut tasks = self.tasks.lock();
        let Some(pool) = tasks.as_mut() else {
            return;
        };
        pool.spawn("maintenance", move |shutdown| maintenance.run(shutdown));
        if !members.is_empty() {
            pool.spawn("announce", move |shutdown| async move {
                for member in members {
                    if *shutdown.borrow() {
                        break;
                    }
                    if !peers.announce(member, local).await {
                        tracing::debug!("{} did not acknowledge our arrival", member);
                    }
                }
            });
        }
    }

    /// Merge entries into the routing table, ignoring any claim on our own address
    pub fn update_routing_table<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = RoutingTableEntry>,
    {
        let local = self.identity.read().address();
        self.table
            .merge(entries.into_iter().filter(|entry| entry.address != local))
    }

    /// Evict the member at `address`
    pub fn remove_node(&self, address: SocketAddr) -> Result<bool> {
        self.state.ensure_connected()?;
        if address == self.identity.read().address() {
            return Ok(false);
        }
        let removed = self.table.remove_address(&address);
        if removed {
            tracing::info!("Removed member {}", address);
        }
        Ok(removed)
    }

    /// Run one maintenance round now
    pub async fn synchronize(&self) -> Result<RoundReport> {
        self.state.ensure_connected()?;
        let maintenance = self.maintenance.lock().clone();
        let shutdown = self.tasks.lock().as_ref().map(TaskPool::subscribe);
        match (maintenance, shutdown) {
            (Some(maintenance), Some(shutdown)) => Ok(maintenance.sync_round(&shutdown).await),
            _ => Err(NodeError::NotConnected(self.state.current())),
        }
    }

    /// Join the overlay and stay in it until `shutdown` resolves
    ///
    /// `shutdown` is watched from the first moment, so a signal that lands
    /// while the join is still retrying cancels it. Every exit path runs
    /// [`stop`](Self::stop).
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let joined = tokio::select! {
            result = self.start() => Some(result),
            _ = &mut shutdown => None,
        };

        match joined {
            Some(Ok(())) => {
                shutdown.await;
                tracing::info!("Shutting down...");
            }
            Some(Err(e)) => {
                tracing::error!("Failed to join the overlay: {}", e);
                self.stop().await;
                return Err(e);
            }
            None => tracing::info!("Shutdown requested while joining"),
        }

        self.stop().await;
        Ok(())
    }

    /// Leave the overlay and release everything `start` acquired
    ///
    /// Best effort: failures are logged and the node always ends up IDLE.
    /// Safe to call repeatedly and after a failed `start`.
    pub async fn stop(&self) {
        self.server.stop().await;

        let identity = self.identity();
        let state = self.state.current();
        if state != NodeState::Idle {
            match self.bootstrap.unregister(&identity).await {
                Ok(true) => tracing::info!("Unregistered {}", identity.address()),
                Ok(false) => tracing::warn!("Bootstrap server refused to unregister {}", identity.address()),
                Err(e) => tracing::warn!("Failed to unregister {}: {}", identity.address(), e),
            }
        }

        if state == NodeState::Connected {
            let local = identity.address();
            for member in self.table.sorted_entries() {
                if member.address == local {
                    continue;
                }
                if !self.peers.disconnect(member.address, local).await {
                    tracing::debug!("{} did not acknowledge our departure", member.address);
                }
            }
        }
        self.peers.stop();

        let pool = self.tasks.lock().take();
        if let Some(pool) = pool {
            if !pool.shutdown(self.config.grace_period()).await {
                tracing::warn!("Background tasks did not finish within the grace period");
            }
        }
        self.maintenance.lock().take();
        self.table.clear();

        if state != NodeState::Idle {
            if let Err(e) = self.state.advance(NodeState::Idle) {
                tracing::error!("{}", e);
            }
            tracing::info!("Node {} left the overlay", identity.address());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use ringnet_core::transport::mock::{MockPeerLink, MockRendezvous};
    use std::time::Duration;

    type TestNode = Node<Arc<MockRendezvous>, MockPeerLink>;

    fn config() -> Config {
        Config {
            node: NodeConfig {
                port: 0,
                username: Some("tester".to_string()),
                ..NodeConfig::default()
            },
            ..Config::default()
        }
    }

    fn node(rendezvous: &Arc<MockRendezvous>) -> TestNode {
        Node::new(config(), Arc::clone(rendezvous), MockPeerLink::new()).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn entry(port: u16, node_id: NodeId) -> RoutingTableEntry {
        RoutingTableEntry::new(addr(port), node_id)
    }

    #[tokio::test]
    async fn test_first_node_connects_alone() {
        let rendezvous = Arc::new(MockRendezvous::new());
        let node = node(&rendezvous);

        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Connected);
        assert!(node.peers().is_running());

        let local = node.identity();
        assert_ne!(local.port, 0);
        assert_eq!(Some(local.port), node.local_addr().map(|a| a.port()));
        let node_id = node.node_id().unwrap();
        assert!((1..=36).contains(&node_id));
        assert_eq!(node.routing_table().sorted_entries(), vec![local.entry().unwrap()]);
        assert_eq!(rendezvous.registered(), vec![local.address()]);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_join_merges_peer_tables_and_announces() {
        let rendezvous = Arc::new(MockRendezvous::with_peers(vec![addr(4001)]));
        let node = node(&rendezvous);
        node.peers()
            .set_table(addr(4001), vec![entry(4001, 5), entry(4002, 9)]);

        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Connected);
        assert_eq!(node.routing_table().len(), 3);
        let node_id = node.node_id().unwrap();
        assert!(node_id != 5 && node_id != 9);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let local = node.identity().entry().unwrap();
        let mut announced = node.peers().announcements();
        announced.sort();
        assert_eq!(announced, vec![(addr(4001), local), (addr(4002), local)]);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_join_is_all_or_nothing() {
        let rendezvous = Arc::new(MockRendezvous::with_peers(vec![addr(4001), addr(4002)]));
        let node = node(&rendezvous);
        node.peers()
            .set_table(addr(4002), vec![entry(4002, 2), entry(4003, 3), entry(4004, 4)]);

        let result = node.start().await;
        assert!(matches!(result, Err(NodeError::JoinFailed(_))));
        assert_eq!(node.state(), NodeState::Registered);
        assert!(node.routing_table().is_empty());
        assert_eq!(node.node_id(), None);

        node.stop().await;
        assert_eq!(node.state(), NodeState::Idle);
        assert_eq!(rendezvous.registered().len(), 2);
    }

    #[tokio::test]
    async fn test_registration_failure_stays_idle() {
        let rendezvous = Arc::new(MockRendezvous::new());
        rendezvous.set_failing(true);
        let node = node(&rendezvous);

        let result = node.start().await;
        assert!(matches!(result, Err(NodeError::Registration(_))));
        assert_eq!(node.state(), NodeState::Idle);

        node.stop().await;
        assert_eq!(node.state(), NodeState::Idle);
        assert_eq!(rendezvous.unregister_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let rendezvous = Arc::new(MockRendezvous::new());
        let node = node(&rendezvous);
        node.start().await.unwrap();

        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidTransition {
                from: NodeState::Connected,
                ..
            })
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_remove_node_requires_connected() {
        let rendezvous = Arc::new(MockRendezvous::with_peers(vec![addr(4001)]));
        let node = node(&rendezvous);
        node.peers().set_table(addr(4001), vec![entry(4001, 5)]);

        assert!(matches!(
            node.remove_node(addr(4001)),
            Err(NodeError::NotConnected(NodeState::Idle))
        ));

        node.start().await.unwrap();
        assert!(node.remove_node(addr(4001)).unwrap());
        assert!(!node.remove_node(addr(4001)).unwrap());
        assert!(!node.remove_node(node.identity().address()).unwrap());
        assert_eq!(node.routing_table().len(), 1);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_update_routing_table_protects_self() {
        let rendezvous = Arc::new(MockRendezvous::new());
        let node = node(&rendezvous);
        node.start().await.unwrap();
        let local = node.identity().entry().unwrap();

        let changed = node.update_routing_table(vec![
            RoutingTableEntry::new(local.address, local.node_id % 36 + 1),
            entry(4010, 10),
        ]);
        assert_eq!(changed, 1);
        assert_eq!(node.routing_table().find_by_node_id(local.node_id), Some(local));

        node.stop().await;
    }

    #[tokio::test]
    async fn test_synchronize_pings_predecessors() {
        let rendezvous = Arc::new(MockRendezvous::with_peers(vec![addr(4001)]));
        let node = node(&rendezvous);
        node.peers().set_table(addr(4001), vec![entry(4001, 5)]);

        assert!(node.synchronize().await.is_err());
        node.start().await.unwrap();

        node.peers()
            .set_table(addr(4001), vec![entry(4001, 5), entry(4002, 6)]);
        let report = node.synchronize().await.unwrap();
        assert_eq!(report.synced, vec![addr(4001)]);
        assert_eq!(report.merged, 1);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_and_is_idempotent() {
        let rendezvous = Arc::new(MockRendezvous::with_peers(vec![addr(4001)]));
        let node = node(&rendezvous);
        node.peers()
            .set_table(addr(4001), vec![entry(4001, 5), entry(4002, 9)]);
        node.start().await.unwrap();
        let local = node.identity().address();

        node.stop().await;
        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.routing_table().is_empty());
        assert!(!node.peers().is_running());
        assert!(node.local_addr().is_none());
        assert_eq!(rendezvous.registered(), vec![addr(4001)]);

        let mut departures = node.peers().departures();
        departures.sort();
        assert_eq!(departures, vec![(addr(4001), local), (addr(4002), local)]);

        node.stop().await;
        assert_eq!(rendezvous.unregister_calls(), 1);
        assert_eq!(node.peers().departures().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_keeps_node_id() {
        let rendezvous = Arc::new(MockRendezvous::new());
        let node = node(&rendezvous);

        node.start().await.unwrap();
        let first = node.node_id();
        node.stop().await;

        node.start().await.unwrap();
        assert_eq!(node.node_id(), first);
        assert_eq!(node.state(), NodeState::Connected);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_start_registers_once() {
        let rendezvous = Arc::new(MockRendezvous::new());
        rendezvous.set_latency(Duration::from_millis(50));
        let node = node(&rendezvous);

        let (first, second) = tokio::join!(node.start(), node.start());
        assert!(first.is_ok() ^ second.is_ok());
        assert!(matches!(
            first.err().or(second.err()),
            Some(NodeError::StartInProgress)
        ));
        assert_eq!(rendezvous.register_calls(), 1);
        assert_eq!(node.state(), NodeState::Connected);

        node.stop().await;
        assert_eq!(rendezvous.unregister_calls(), 1);
        assert!(rendezvous.registered().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_shutdown_interrupts_join() {
        let rendezvous = Arc::new(MockRendezvous::new());
        rendezvous.set_latency(Duration::from_secs(30));
        let node = node(&rendezvous);

        let run = node.run_until(tokio::time::sleep(Duration::from_millis(50)));
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("shutdown did not interrupt the join")
            .unwrap();

        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.local_addr().is_none());
        assert!(!node.peers().is_running());
        assert!(rendezvous.registered().is_empty());

        // The interrupted start released its claim
        rendezvous.set_latency(Duration::ZERO);
        node.start().await.unwrap();
        node.stop().await;
    }

    #[tokio::test]
    async fn test_run_until_leaves_after_joining() {
        let rendezvous = Arc::new(MockRendezvous::new());
        let node = node(&rendezvous);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = node.run_until(async {
            let _ = rx.await;
        });
        let watcher = async {
            for _ in 0..200 {
                if node.state() == NodeState::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(rendezvous.registered().len(), 1);
            let _ = tx.send(());
        };

        let (result, ()) = tokio::join!(run, watcher);
        result.unwrap();
        assert_eq!(node.state(), NodeState::Idle);
        assert!(rendezvous.registered().is_empty());
        assert_eq!(rendezvous.unregister_calls(), 1);
    }

    #[tokio::test]
    async fn test_run_until_reports_failed_join() {
        let rendezvous = Arc::new(MockRendezvous::new());
        rendezvous.set_failing(true);
        let node = node(&rendezvous);

        let result = node.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(NodeError::Registration(_))));
        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.local_addr().is_none());
    }
}
