//! Error types for the overlay node

use crate::state::NodeState;
use ringnet_dht::DhtError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] ringnet_core::Error),

    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: NodeState, to: NodeState },

    #[error("Node is {0}, expected CONNECTED")]
    NotConnected(NodeState),

    #[error("Registration with bootstrap server failed: {0}")]
    Registration(#[source] ringnet_core::Error),

    #[error("Node is already starting")]
    StartInProgress,

    #[error("Join failed: {0}")]
    JoinFailed(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
