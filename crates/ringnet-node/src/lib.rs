//! ringnet Node Library
//!
//! A member of the ringnet overlay: registers with the bootstrap server,
//! joins the ring by pulling routing tables from existing members, serves
//! its own table to peers and keeps it fresh in the background.

pub mod bootstrap;
pub mod communicator;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod node;
pub mod server;
pub mod state;
pub mod tasks;

pub use bootstrap::BootstrapConnector;
pub use communicator::Communicator;
pub use config::Config;
pub use error::{NodeError, Result};
pub use node::Node;
pub use state::NodeState;
