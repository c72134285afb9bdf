//! # kvraft-node
//!
//! why: host the pure raft core as a running, networked cache node
//! relations: drives kvraft-core, persists through kvraft-storage, serves peers over a RaftTransport
//! what: NodeConfig, spawn_node / NodeHandle, in-memory and http transports, tracing setup

pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;
pub mod transport;

pub use config::NodeConfig;
pub use error::{NodeError, TransportError};
pub use runtime::{spawn_node, NodeHandle};
pub use transport::{raft_router, HttpTransport, InMemoryNetwork, InMemoryTransport, RaftTransport};
