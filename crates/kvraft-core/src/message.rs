//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced by election.rs / replication.rs, carried by kvraft-node transports
//! what: RequestVote and AppendEntries request/response pairs, outbound envelopes

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest index this request covers once accepted.
    pub fn last_covered_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success: highest index known to match the leader's log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_index: Option<LogIndex>,
    /// On a consistency rejection: index the leader should retry from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            matched_index: None,
            conflict_index: None,
        }
    }
}

/// Requests a node sends to its peers. Responses travel back on the same call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            Self::RequestVote(req) => req.term,
            Self::AppendEntries(req) => req.term,
        }
    }
}

/// A message addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: RaftMessage,
}
