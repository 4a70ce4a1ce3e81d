//! ringnet DHT - ring routing table and identifier assignment
//!
//! This crate holds a node's local view of the overlay: which members exist,
//! where they sit on the identifier ring, and which of them have stopped
//! answering.

pub mod liveness;
pub mod routing;

pub use liveness::SuspectList;
pub use routing::{MergeOutcome, RoutingTable};

use rand::Rng;
use ringnet_core::{NodeId, ADDRESSES_PER_CHARACTER, ADDRESS_SPACE_SIZE};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DhtError {
    #[error("Every identifier class in [1, {size}] is already taken")]
    SpaceExhausted { size: u32 },

    #[error("Identifier granularity must be at least 1")]
    InvalidGranularity,
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// The identifier ring's size and its coarse-class granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpace {
    /// Identifiers live in `[1, address_space_size]`
    pub address_space_size: u32,
    /// Identifiers per coarse class
    pub addresses_per_character: u32,
}

impl Default for IdSpace {
    fn default() -> Self {
        Self {
            address_space_size: ADDRESS_SPACE_SIZE,
            addresses_per_character: ADDRESSES_PER_CHARACTER,
        }
    }
}

impl IdSpace {
    pub fn new(address_space_size: u32, addresses_per_character: u32) -> Result<Self> {
        if addresses_per_character == 0 {
            return Err(DhtError::InvalidGranularity);
        }
        Ok(Self {
            address_space_size,
            addresses_per_character,
        })
    }

    /// Coarse class of an identifier
    pub fn class_of(&self, id: NodeId) -> u32 {
        id / self.addresses_per_character.max(1)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        (1..=self.address_space_size).contains(&id)
    }
}

/// Pick an identifier whose coarse class no entry of `table` occupies.
///
/// Draws uniformly from `[1, address_space_size]` and rejects candidates
/// whose class is already used. Fails instead of spinning forever when the
/// table covers every class.
pub fn select_node_id<R: Rng + ?Sized>(
    table: &RoutingTable,
    space: &IdSpace,
    rng: &mut R,
) -> Result<NodeId> {
    if space.addresses_per_character == 0 {
        return Err(DhtError::InvalidGranularity);
    }

    let used: HashSet<u32> = table
        .entries()
        .iter()
        .map(|entry| space.class_of(entry.node_id))
        .collect();

    let free = (1..=space.address_space_size).any(|id| !used.contains(&space.class_of(id)));
    if !free {
        return Err(DhtError::SpaceExhausted {
            size: space.address_space_size,
        });
    }

    loop {
        let candidate = rng.gen_range(1..=space.address_space_size);
        if !used.contains(&space.class_of(candidate)) {
            return Ok(candidate);
        }
    }
}
