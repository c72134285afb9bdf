//! # error
//!
//! why: one error taxonomy for the consensus core
//! relations: returned by node.rs / log.rs / cache.rs, wrapped by kvraft-node's NodeError
//! what: client-facing (NotLeader, QuorumUnavailable) and internal rejection variants

use crate::{LogIndex, NodeId, Term};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// Write submitted to a node that is not the leader; retry against `leader_hint`.
    #[error("node {node_id} is not the leader (leader hint: {leader_hint:?})")]
    NotLeader {
        node_id: NodeId,
        leader_hint: Option<NodeId>,
    },

    /// The leader could not get a majority to store the entry in time.
    /// The entry stays in the log and may still commit later.
    #[error("quorum unavailable: entry {index} not committed within {waited_ms}ms")]
    QuorumUnavailable { index: LogIndex, waited_ms: u64 },

    /// AppendEntries consistency check failed; drives leader backtracking only.
    #[error("log has no entry at {prev_log_index} with term {prev_log_term}")]
    LogInconsistency {
        prev_log_index: LogIndex,
        prev_log_term: Term,
    },

    /// Message from an older term.
    #[error("stale term {received} (current term {current})")]
    StaleTerm { received: Term, current: Term },

    /// An entry would leave a hole in the log or the applied sequence.
    #[error("non-contiguous entry: expected index {expected}, got {got}")]
    NonContiguousEntry { expected: LogIndex, got: LogIndex },

    /// A follower was asked to drop entries it already committed.
    #[error("refusing to truncate committed entry {index} (commit index {commit_index})")]
    CommittedTruncation {
        index: LogIndex,
        commit_index: LogIndex,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RaftError {
    /// True for errors a client should resolve by retrying elsewhere or later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLeader { .. } | Self::QuorumUnavailable { .. })
    }
}
