//! Periodic routing table synchronization
//!
//! Each round pings this node's nearest ring predecessors with our table,
//! merges what they answer with, and tracks members that stop answering.
//! A member is evicted only after several consecutive failed rounds.

use ringnet_core::{PeerLink, RoutingTableEntry};
use ringnet_dht::{RoutingTable, SuspectList};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What one synchronization round did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Peers that answered
    pub synced: Vec<SocketAddr>,
    /// Table entries added or corrected
    pub merged: usize,
    /// Peers that failed to answer this round
    pub suspected: Vec<SocketAddr>,
    /// Peers removed from the table this round
    pub evicted: Vec<SocketAddr>,
}

pub struct Maintenance<P> {
    table: Arc<RoutingTable>,
    peers: P,
    local: RoutingTableEntry,
    suspects: SuspectList,
    predecessors: usize,
    initial_delay: Duration,
    period: Duration,
}

impl<P: PeerLink> Maintenance<P> {
    pub fn new(
        table: Arc<RoutingTable>,
        peers: P,
        local: RoutingTableEntry,
        config: &crate::config::MaintenanceConfig,
    ) -> Self {
        Self {
            table,
            peers,
            local,
            suspects: SuspectList::new(config.suspicion_threshold),
            predecessors: config.predecessors,
            initial_delay: config.initial_delay(),
            period: config.period().max(Duration::from_millis(1)),
        }
    }

    pub fn suspects(&self) -> &SuspectList {
        &self.suspects
    }

    /// Run rounds until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.sync_round(&shutdown).await;
                    if !report.evicted.is_empty() {
                        tracing::info!("Evicted unresponsive members {:?}", report.evicted);
                    }
                }
            }
        }
        tracing::debug!("Routing table maintenance stopped");
    }

    /// One synchronization round
    pub async fn sync_round(&self, shutdown: &watch::Receiver<bool>) -> RoundReport {
        let mut report = RoundReport::default();
        let targets = self
            .table
            .predecessors_of(self.local.node_id, self.predecessors + 1)
            .into_iter()
            .filter(|entry| entry.address != self.local.address)
            .take(self.predecessors);

        for target in targets {
            if *shutdown.borrow() {
                break;
            }

            match self
                .peers
                .ping(target.address, self.local.node_id, self.table.sorted_entries())
                .await
            {
                Ok(entries) => {
                    self.suspects.record_success(&target.address);
                    let local = self.local.address;
                    report.merged += self
                        .table
                        .merge(entries.into_iter().filter(|entry| entry.address != local));
                    report.synced.push(target.address);
                }
                Err(e) => {
                    tracing::warn!("Ping to {} failed: {}", target, e);
                    report.suspected.push(target.address);
                    if self.suspects.record_failure(target.address) {
                        self.table.remove_address(&target.address);
                        report.evicted.push(target.address);
                    }
                }
            }
        }

        tracing::debug!(
            "Sync round: {} synced, {} merged, {} suspected",
            report.synced.len(),
            report.merged,
            report.suspected.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaintenanceConfig;
    use ringnet_core::transport::mock::MockPeerLink;

    fn entry(port: u16, node_id: u32) -> RoutingTableEntry {
        RoutingTableEntry::new(format!("127.0.0.1:{}", port).parse().unwrap(), node_id)
    }

    fn setup(entries: &[RoutingTableEntry]) -> (Arc<MockPeerLink>, Maintenance<Arc<MockPeerLink>>) {
        let table = Arc::new(RoutingTable::new());
        table.merge(entries.iter().copied());
        let peers = Arc::new(MockPeerLink::new());
        let config = MaintenanceConfig {
            initial_delay_ms: 0,
            period_ms: 10,
            ..MaintenanceConfig::default()
        };
        let maintenance = Maintenance::new(table, Arc::clone(&peers), entry(5020, 20), &config);
        (peers, maintenance)
    }

    #[tokio::test]
    async fn test_round_targets_two_predecessors() {
        let (peers, maintenance) = setup(&[
            entry(5005, 5),
            entry(5010, 10),
            entry(5020, 20),
            entry(5030, 30),
        ]);
        peers.set_table(entry(5010, 10).address, vec![entry(5010, 10), entry(5033, 33)]);
        let (_tx, rx) = watch::channel(false);

        let report = maintenance.sync_round(&rx).await;
        assert_eq!(peers.pings(), vec![entry(5010, 10).address, entry(5005, 5).address]);
        assert_eq!(report.synced.len(), 2);
        assert_eq!(report.merged, 1);
        assert_eq!(maintenance.table.find_by_node_id(33), Some(entry(5033, 33)));
    }

    #[tokio::test]
    async fn test_predecessors_wrap_around() {
        let (peers, maintenance) = setup(&[entry(5020, 20), entry(5030, 30)]);
        let (_tx, rx) = watch::channel(false);

        maintenance.sync_round(&rx).await;
        assert_eq!(peers.pings(), vec![entry(5030, 30).address]);
    }

    #[tokio::test]
    async fn test_unresponsive_member_is_evicted_after_threshold() {
        let (peers, maintenance) = setup(&[entry(5010, 10), entry(5020, 20)]);
        let dead = entry(5010, 10).address;
        peers.set_unreachable(dead, true);
        let (_tx, rx) = watch::channel(false);

        for _ in 0..2 {
            let report = maintenance.sync_round(&rx).await;
            assert_eq!(report.suspected, vec![dead]);
            assert!(report.evicted.is_empty());
        }
        assert_eq!(maintenance.suspects().failures(&dead), 2);

        let report = maintenance.sync_round(&rx).await;
        assert_eq!(report.evicted, vec![dead]);
        assert_eq!(maintenance.table.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_clears_suspicion() {
        let (peers, maintenance) = setup(&[entry(5010, 10), entry(5020, 20)]);
        let flaky = entry(5010, 10).address;
        let (_tx, rx) = watch::channel(false);

        peers.set_unreachable(flaky, true);
        maintenance.sync_round(&rx).await;
        peers.set_unreachable(flaky, false);
        maintenance.sync_round(&rx).await;

        assert_eq!(maintenance.suspects().failures(&flaky), 0);
    }

    #[tokio::test]
    async fn test_peer_cannot_rewrite_our_entry() {
        let (peers, maintenance) = setup(&[entry(5010, 10), entry(5020, 20)]);
        peers.set_table(entry(5010, 10).address, vec![entry(5020, 7)]);
        let (_tx, rx) = watch::channel(false);

        maintenance.sync_round(&rx).await;
        assert_eq!(maintenance.table.find_by_node_id(20), Some(entry(5020, 20)));
    }

    #[tokio::test]
    async fn test_cancelled_round_contacts_nobody() {
        let (peers, maintenance) = setup(&[entry(5010, 10), entry(5020, 20)]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = maintenance.sync_round(&rx).await;
        assert_eq!(report, RoundReport::default());
        assert!(peers.pings().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (peers, maintenance) = setup(&[entry(5010, 10), entry(5020, 20)]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(maintenance).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!peers.pings().is_empty());
    }
}
