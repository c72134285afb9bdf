//! # kvraft-core
//!
//! why: implement the raft consensus core of the replicated cache as pure, i/o-free rust
//! relations: driven by kvraft-node (event loop + transport), persisted via kvraft-storage
//! what: log store, election, replication, node state machine, cache state machine, wire types

pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod timer;

mod election;
mod replication;

/// Identifier of a cluster member.
pub type NodeId = u64;
/// Election epoch.
pub type Term = u64;
/// 1-based position in the replicated log; 0 means "before the first entry".
pub type LogIndex = u64;

pub use cache::{CacheEntry, CacheStateMachine, CacheStats, Clock, ManualClock, SystemClock};
pub use command::Command;
pub use config::RaftConfig;
pub use error::RaftError;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
pub use node::{HardState, LogOp, NodeState, PersistentState, RaftNode, RaftStatus, Ready};
pub use timer::ElectionTimer;
