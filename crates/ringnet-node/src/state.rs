//! Node lifecycle state machine

use crate::error::{NodeError, Result};
use parking_lot::RwLock;
use std::fmt;

/// Where a node is in its join/leave lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum NodeState {
    #[default]
    Idle,
    Registered,
    Connected,
}

impl NodeState {
    /// Whether `self -> to` is a legal lifecycle step
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Idle, Registered) | (Registered, Connected) | (Registered, Idle) | (Connected, Idle)
        )
    }

    /// The state after `self -> to`, or an error naming the illegal step
    pub fn transition(self, to: NodeState) -> Result<NodeState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(NodeError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Idle => "IDLE",
            NodeState::Registered => "REGISTERED",
            NodeState::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// Shared, lock-guarded [`NodeState`]
#[derive(Debug, Default)]
pub struct StateMachine {
    state: RwLock<NodeState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is(&self, state: NodeState) -> bool {
        self.current() == state
    }

    /// Move to `to`, returning the previous state
    pub fn advance(&self, to: NodeState) -> Result<NodeState> {
        let mut state = self.state.write();
        let previous = *state;
        *state = previous.transition(to)?;
        tracing::debug!("Node state {} -> {}", previous, to);
        Ok(previous)
    }

    /// Fail fast unless the node is connected
    pub fn ensure_connected(&self) -> Result<()> {
        match self.current() {
            NodeState::Connected => Ok(()),
            other => Err(NodeError::NotConnected(other)),
        }
    }
}
