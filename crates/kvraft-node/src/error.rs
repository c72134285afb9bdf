//! # error
//!
//! why: errors surfaced by the async runtime to callers and transports
//! relations: wraps kvraft-core's RaftError and kvraft-storage's StorageError
//! what: NodeError (client-facing), TransportError (peer rpc failures)

use kvraft_core::{NodeId, RaftError};
use kvraft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// NotLeader, QuorumUnavailable and the other consensus outcomes.
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid node configuration: {0}")]
    Config(String),

    /// The node's event loop is gone (shut down or halted on a storage failure).
    #[error("node {0} has stopped")]
    Stopped(NodeId),
}

impl NodeError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::Raft(RaftError::NotLeader { .. }))
    }

    pub fn is_quorum_unavailable(&self) -> bool {
        matches!(self, Self::Raft(RaftError::QuorumUnavailable { .. }))
    }

    /// Leader the caller should retry against, when known.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            Self::Raft(RaftError::NotLeader { leader_hint, .. }) => *leader_hint,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node {from} cannot reach node {to}")]
    Unreachable { from: NodeId, to: NodeId },

    #[error("no route to node {0}")]
    UnknownPeer(NodeId),

    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered but could not serve the rpc.
    #[error("peer {peer} failed the rpc: {reason}")]
    Remote { peer: NodeId, reason: String },
}
