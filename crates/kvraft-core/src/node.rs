//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: election.rs and replication.rs extend RaftNode; kvraft-node drives it
//! what: NodeState, RaftNode, Ready (persist-then-send side effects), status, apply cursor

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::{LogEntry, RaftLog};
use crate::message::{Outbound, RaftMessage};
use crate::timer::ElectionTimer;
use crate::{LogIndex, NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        }
    }
}

/// Term and vote; must hit disk before any response that depends on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// A log mutation the host must mirror into durable storage, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    Append(Vec<LogEntry>),
    TruncateFrom(LogIndex),
}

/// Side effects accumulated since the last `take_ready`.
///
/// Persist `hard_state` and `log_ops` first, then deliver `messages`
/// and any RPC response produced by the same step.
#[derive(Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub log_ops: Vec<LogOp>,
    pub messages: Vec<Outbound>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.log_ops.is_empty() && self.messages.is_empty()
    }
}

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub log: Vec<LogEntry>,
}

/// Point-in-time view used for `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,
    pub last_log_index: LogIndex,
    pub is_leader: bool,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the fixed cluster, this node included
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Last leader heard from in the current term
    pub leader_id: Option<NodeId>,
    /// Distinct grants collected while a candidate
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, LogIndex>,

    pub(crate) election_timer: ElectionTimer,
    pub(crate) heartbeat_due: u64,
    pub(crate) now: u64,
    pub(crate) hard_state_dirty: bool,
    pub(crate) ready: Ready,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        let mut election_timer =
            ElectionTimer::new(config.election_timeout_min, config.election_timeout_max);
        election_timer.reset(0);
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_timer,
            heartbeat_due: 0,
            now: 0,
            hard_state_dirty: false,
            ready: Ready::default(),
        }
    }

    /// Rebuild a node after a restart. It always comes back as a follower
    /// with commit and apply cursors at zero.
    pub fn restore(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        persisted: PersistentState,
    ) -> Result<Self, RaftError> {
        let log = RaftLog::from_entries(persisted.log)?;
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = persisted.hard_state.term;
        node.voted_for = persisted.hard_state.voted_for;
        node.log = log;
        info!(
            node = id,
            term = node.current_term,
            last_log_index = node.last_log_index(),
            "restored persisted raft state"
        );
        Ok(node)
    }

    /// Replace the election timer, e.g. with a seeded one in tests.
    pub fn set_election_timer(&mut self, mut timer: ElectionTimer) {
        timer.reset(self.now);
        self.election_timer = timer;
    }

    /// Advance logical time; fires elections and leader heartbeats when due.
    pub fn tick(&mut self, now: u64) {
        self.now = self.now.max(now);
        match self.state {
            NodeState::Leader => {
                if self.now >= self.heartbeat_due {
                    self.broadcast_append_entries();
                }
            }
            NodeState::Follower | NodeState::Candidate => {
                if self.election_timer.is_expired(self.now) {
                    info!(
                        node = self.id,
                        term = self.current_term,
                        "election timeout elapsed"
                    );
                    self.start_election();
                }
            }
        }
    }

    /// Step down to follower, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.hard_state_dirty = true;
        }
        if self.state != NodeState::Follower {
            info!(
                node = self.id,
                term = self.current_term,
                from = self.state.as_str(),
                "stepping down to follower"
            );
            self.state = NodeState::Follower;
            self.election_timer.reset(self.now);
        }
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |id| *id != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at `index`, 0 when the index is absent.
    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    /// Committed entries not yet handed to the state machine, in order.
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self
            .log
            .range(self.last_applied + 1, self.commit_index + 1)
            .to_vec();
        self.last_applied = self.commit_index;
        entries
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.state,
            term: self.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            leader_id: self.leader_id,
            last_log_index: self.last_log_index(),
            is_leader: self.is_leader(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn has_ready(&self) -> bool {
        self.hard_state_dirty || !self.ready.is_empty()
    }

    /// Drain pending side effects.
    pub fn take_ready(&mut self) -> Ready {
        let mut ready = std::mem::take(&mut self.ready);
        if std::mem::take(&mut self.hard_state_dirty) {
            ready.hard_state = Some(self.hard_state());
        }
        ready
    }

    pub(crate) fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.ready.messages.push(Outbound { to, message });
    }

    pub(crate) fn record_log_op(&mut self, op: LogOp) {
        self.ready.log_ops.push(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(!node.has_ready());
    }

    #[test]
    fn tick_before_deadline_does_nothing() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.tick(10);
        assert_eq!(node.state, NodeState::Follower);
        assert!(node.take_ready().is_empty());
    }

    #[test]
    fn tick_past_deadline_starts_election() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.tick(node.config.election_timeout_max + 1);

        assert_eq!(node.state, NodeState::Candidate);
        let ready = node.take_ready();
        assert_eq!(ready.hard_state, Some(HardState { term: 1, voted_for: Some(1) }));
        assert_eq!(ready.messages.len(), 2);
    }

    #[test]
    fn restore_keeps_term_vote_and_log() {
        let persisted = PersistentState {
            hard_state: HardState { term: 4, voted_for: Some(2) },
            log: vec![
                LogEntry::new(1, 1, Command::set("a", 1)),
                LogEntry::new(4, 2, Command::delete("a")),
            ],
        };
        let node = RaftNode::restore(3, vec![1, 2, 3], RaftConfig::default(), persisted).unwrap();

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for, Some(2));
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
    }

    #[test]
    fn restore_rejects_gapped_log() {
        let persisted = PersistentState {
            hard_state: HardState::default(),
            log: vec![LogEntry::new(1, 2, Command::Clear)],
        };
        let result = RaftNode::restore(1, vec![1], RaftConfig::default(), persisted);
        assert!(matches!(result, Err(RaftError::NonContiguousEntry { .. })));
    }

    #[test]
    fn entries_to_apply_advance_cursor_once() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(1, Command::set("a", 1));
        node.log.append(1, Command::set("b", 2));
        node.commit_index = 2;

        assert_eq!(node.get_entries_to_apply().len(), 2);
        assert_eq!(node.last_applied, 2);
        assert!(node.get_entries_to_apply().is_empty());
    }
}
