//! Ring routing table implementation

use parking_lot::RwLock;
use ringnet_core::{NodeId, RoutingTableEntry};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// What [`RoutingTable::add_entry`] did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The address was new
    Inserted,
    /// The address was already known under the same identifier
    Unchanged,
    /// The address was known under a different identifier, now overwritten
    Corrected { previous: NodeId },
}

/// The set of known overlay members, keyed by address
///
/// Every operation takes the internal lock once, so each call is atomic on
/// its own. Sequences of calls are not: a caller reading a successor and then
/// removing it may race a concurrent insert.
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// At most one identifier per address
    entries: RwLock<HashMap<SocketAddr, NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> HashSet<RoutingTableEntry> {
        self.entries
            .read()
            .iter()
            .map(|(&address, &node_id)| RoutingTableEntry::new(address, node_id))
            .collect()
    }

    /// Snapshot ordered by identifier, then address
    pub fn sorted_entries(&self) -> Vec<RoutingTableEntry> {
        let mut entries: Vec<_> = self.entries().into_iter().collect();
        entries.sort_unstable_by_key(|e| (e.node_id, e.address));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert an entry, or correct the identifier of an address already known.
    ///
    /// Last writer wins, so applying the same entries any number of times
    /// converges to the same table.
    pub fn add_entry(&self, entry: RoutingTableEntry) -> MergeOutcome {
        let mut entries = self.entries.write();
        match entries.insert(entry.address, entry.node_id) {
            None => MergeOutcome::Inserted,
            Some(previous) if previous == entry.node_id => MergeOutcome::Unchanged,
            Some(previous) => {
                tracing::debug!(
                    "Corrected node id of {} from {} to {}",
                    entry.address,
                    previous,
                    entry.node_id
                );
                MergeOutcome::Corrected { previous }
            }
        }
    }

    /// Apply [`add_entry`](Self::add_entry) to every entry, returning how many changed the table
    pub fn merge<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = RoutingTableEntry>,
    {
        entries
            .into_iter()
            .filter(|entry| self.add_entry(*entry) != MergeOutcome::Unchanged)
            .count()
    }

    /// Remove an entry only if both its address and identifier match
    pub fn remove_entry(&self, entry: &RoutingTableEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&entry.address) {
            Some(&node_id) if node_id == entry.node_id => {
                entries.remove(&entry.address);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever entry sits at `address`
    pub fn remove_address(&self, address: &SocketAddr) -> bool {
        self.entries.write().remove(address).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Entry with exactly this identifier
    pub fn find_by_node_id(&self, node_id: NodeId) -> Option<RoutingTableEntry> {
        self.sorted_entries()
            .into_iter()
            .find(|e| e.node_id == node_id)
    }

    /// Smallest entry with `id >= node_id`, wrapping to the smallest entry overall
    pub fn find_node_or_successor(&self, node_id: NodeId) -> Option<RoutingTableEntry> {
        let sorted = self.sorted_entries();
        sorted
            .iter()
            .find(|e| e.node_id >= node_id)
            .or_else(|| sorted.first())
            .copied()
    }

    /// Smallest entry with `id > node_id`, wrapping to the smallest entry
    /// unless that would be `node_id` itself
    pub fn find_successor_of(&self, node_id: NodeId) -> Option<RoutingTableEntry> {
        let sorted = self.sorted_entries();
        sorted
            .iter()
            .find(|e| e.node_id > node_id)
            .or_else(|| sorted.first().filter(|e| e.node_id != node_id))
            .copied()
    }

    /// Largest entry with `id < node_id`, wrapping to the largest entry
    /// unless that would be `node_id` itself
    pub fn find_predecessor_of(&self, node_id: NodeId) -> Option<RoutingTableEntry> {
        let sorted = self.sorted_entries();
        sorted
            .iter()
            .rev()
            .find(|e| e.node_id < node_id)
            .or_else(|| sorted.last().filter(|e| e.node_id != node_id))
            .copied()
    }

    /// Up to `count` distinct entries walking counter-clockwise from
    /// `node_id`, never including entries that carry `node_id` itself
    pub fn predecessors_of(&self, node_id: NodeId, count: usize) -> Vec<RoutingTableEntry> {
        let sorted = self.sorted_entries();
        let below = sorted.iter().rev().filter(|e| e.node_id < node_id);
        let above = sorted.iter().rev().filter(|e| e.node_id > node_id);
        below.chain(above).take(count).copied().collect()
    }
}
