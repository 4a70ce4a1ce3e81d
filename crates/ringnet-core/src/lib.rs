//! ringnet Core - Shared types, protocols, and utilities
//!
//! This crate provides the building blocks shared by the ringnet routing
//! table and the overlay node: routing entries, the bootstrap and peer wire
//! protocols, the retry policy, and the client traits the node drives.

pub mod error;
pub mod proto;
pub mod retry;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use transport::{PeerLink, Rendezvous};
pub use types::*;

/// Number of identifiers on the ring, `[1, ADDRESS_SPACE_SIZE]`
pub const ADDRESS_SPACE_SIZE: u32 = 36;

/// Number of distinct identifier classes (one per `[A-Z0-9]` character)
pub const CHARACTER_SPACE_SIZE: u32 = 36;

/// Identifiers per coarse class
pub const ADDRESSES_PER_CHARACTER: u32 = ADDRESS_SPACE_SIZE / CHARACTER_SPACE_SIZE;
