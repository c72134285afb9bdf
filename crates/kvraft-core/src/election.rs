//! # election
//!
//! why: leader election (raft §5.2) and the vote safety rules (§5.4.1)
//! relations: extends RaftNode from node.rs; hands over to replication.rs on winning
//! what: start_election, RequestVote handling, vote counting, become_leader

use tracing::{debug, info};

use crate::command::Command;
use crate::error::RaftError;
use crate::log::LogEntry;
use crate::message::{RaftMessage, RequestVoteRequest, RequestVoteResponse};
use crate::node::{LogOp, NodeState, RaftNode};
use crate::NodeId;

impl RaftNode {
    /// Become a candidate for the next term and ask every peer for its vote.
    pub fn start_election(&mut self) -> RequestVoteRequest {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.hard_state_dirty = true;
        self.votes_received = vec![self.id];
        self.next_index.clear();
        self.match_index.clear();
        self.election_timer.reset(self.now);

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        info!(
            node = self.id,
            term = self.current_term,
            last_log_index = request.last_log_index,
            "starting election"
        );

        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            self.send(peer, RaftMessage::RequestVote(request.clone()));
        }

        // single-node cluster: our own vote is a majority
        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    pub fn handle_request_vote(&mut self, request: &RequestVoteRequest) -> RequestVoteResponse {
        if request.term < self.current_term {
            let reason = RaftError::StaleTerm {
                received: request.term,
                current: self.current_term,
            };
            debug!(node = self.id, candidate = request.candidate_id, %reason, "vote denied");
            return RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if request.term > self.current_term {
            self.become_follower(request.term);
        }

        let free_to_vote = self
            .voted_for
            .map_or(true, |voted| voted == request.candidate_id);
        let log_ok = self
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);
        let vote_granted = free_to_vote && log_ok;

        if vote_granted {
            if self.voted_for != Some(request.candidate_id) {
                self.voted_for = Some(request.candidate_id);
                self.hard_state_dirty = true;
            }
            // a granted vote counts as contact
            self.election_timer.reset(self.now);
        }
        debug!(
            node = self.id,
            term = self.current_term,
            candidate = request.candidate_id,
            vote_granted,
            log_ok,
            "handled vote request"
        );

        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true if this response made us leader.
    pub fn handle_vote_response(&mut self, from: NodeId, response: &RequestVoteResponse) -> bool {
        if response.term > self.current_term {
            self.become_follower(response.term);
            return false;
        }
        if self.state != NodeState::Candidate || response.term < self.current_term {
            return false;
        }
        if !response.vote_granted || !self.cluster_nodes.contains(&from) {
            return false;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Take leadership: fresh replication state, a no-op entry for this
    /// term, and an immediate round of AppendEntries.
    pub(crate) fn become_leader(&mut self) {
        info!(
            node = self.id,
            term = self.current_term,
            votes = self.votes_received.len(),
            "became leader"
        );
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|peer| (*peer, next)).collect();
        self.match_index = peers.iter().map(|peer| (*peer, 0)).collect();

        let noop: LogEntry = self.log.append(self.current_term, Command::Noop);
        self.record_log_op(LogOp::Append(vec![noop]));

        self.broadcast_append_entries();
        self.advance_commit_index();
    }
}
