//! # replication
//!
//! why: log replication and commit advancement (raft §5.3, §5.4.2)
//! relations: extends RaftNode from node.rs; log.rs does the index bookkeeping
//! what: client proposals, AppendEntries creation/handling, leader backtracking, commit rule

use tracing::{debug, error, warn};

use crate::command::Command;
use crate::error::RaftError;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage};
use crate::node::{LogOp, NodeState, RaftNode};
use crate::{LogIndex, NodeId};

impl RaftNode {
    /// Append a client command to the leader's log and start replicating it.
    pub fn propose(&mut self, command: Command) -> Result<LogIndex, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                node_id: self.id,
                leader_hint: self.leader_id,
            });
        }
        let entry = self.log.append(self.current_term, command);
        let index = entry.index;
        debug!(node = self.id, term = self.current_term, index, "proposed entry");
        self.record_log_op(LogOp::Append(vec![entry]));
        self.broadcast_append_entries();
        self.advance_commit_index();
        Ok(index)
    }

    /// AppendEntries for `peer` starting at its `next_index`; empty when it is caught up.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        if !self.is_leader() {
            return None;
        }
        let next = self
            .next_index
            .get(&peer)
            .copied()?
            .clamp(1, self.last_log_index() + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// Queue AppendEntries (heartbeat or catch-up batch) to every peer.
    pub fn broadcast_append_entries(&mut self) {
        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            if let Some(request) = self.create_append_entries(peer) {
                self.send(peer, RaftMessage::AppendEntries(request));
            }
        }
        self.heartbeat_due = self.now + self.config.heartbeat_interval;
    }

    pub fn handle_append_entries(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        if request.term < self.current_term {
            let reason = RaftError::StaleTerm {
                received: request.term,
                current: self.current_term,
            };
            debug!(node = self.id, leader = request.leader_id, %reason, "append rejected");
            return AppendEntriesResponse::rejected(self.current_term);
        }
        if self.state == NodeState::Leader && request.term == self.current_term {
            error!(
                node = self.id,
                term = self.current_term,
                other = request.leader_id,
                "second leader claims our term"
            );
            return AppendEntriesResponse::rejected(self.current_term);
        }

        self.become_follower(request.term);
        self.leader_id = Some(request.leader_id);
        self.election_timer.reset(self.now);

        if !self.log.matches(request.prev_log_index, request.prev_log_term) {
            let reason = RaftError::LogInconsistency {
                prev_log_index: request.prev_log_index,
                prev_log_term: request.prev_log_term,
            };
            let conflict_index = self.log.conflict_hint(request.prev_log_index);
            debug!(node = self.id, %reason, conflict_index, "append rejected");
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched_index: None,
                conflict_index: Some(conflict_index),
            };
        }

        if let Err(reason) = self.merge_entries(&request) {
            error!(node = self.id, %reason, "refusing leader entries");
            return AppendEntriesResponse::rejected(self.current_term);
        }

        let last_new_index = request.last_covered_index();
        let new_commit = request.leader_commit.min(last_new_index);
        if new_commit > self.commit_index {
            debug!(node = self.id, commit_index = new_commit, "follower commit advanced");
            self.commit_index = new_commit;
        }

        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            matched_index: Some(last_new_index),
            conflict_index: None,
        }
    }

    /// Splice the leader's entries in after a successful consistency check.
    ///
    /// Matching entries are skipped, so a duplicated or reordered request
    /// never shortens the log; only a real term conflict truncates.
    fn merge_entries(&mut self, request: &AppendEntriesRequest) -> Result<(), RaftError> {
        for (offset, entry) in request.entries.iter().enumerate() {
            let expected = request.prev_log_index + 1 + offset as LogIndex;
            if entry.index != expected {
                return Err(RaftError::NonContiguousEntry {
                    expected,
                    got: entry.index,
                });
            }
        }

        let mut first_new = request.entries.len();
        for (offset, entry) in request.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(RaftError::CommittedTruncation {
                            index: entry.index,
                            commit_index: self.commit_index,
                        });
                    }
                    let removed = self.log.truncate_from(entry.index);
                    warn!(
                        node = self.id,
                        from_index = entry.index,
                        removed = removed.len(),
                        "truncated conflicting entries"
                    );
                    self.record_log_op(LogOp::TruncateFrom(entry.index));
                    first_new = offset;
                    break;
                }
                None => {
                    first_new = offset;
                    break;
                }
            }
        }

        let mut appended = Vec::new();
        let mut result = Ok(());
        for entry in &request.entries[first_new..] {
            match self.log.push(entry.clone()) {
                Ok(()) => appended.push(entry.clone()),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if !appended.is_empty() {
            self.record_log_op(LogOp::Append(appended));
        }
        result
    }

    /// Update a peer's progress. Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: &AppendEntriesResponse,
    ) -> bool {
        if response.term > self.current_term {
            self.become_follower(response.term);
            return false;
        }
        if !self.is_leader() || response.term < self.current_term {
            return false;
        }
        let Some(&current_next) = self.next_index.get(&from) else {
            return false;
        };
        let current_match = self.match_index.get(&from).copied().unwrap_or(0);

        if response.success {
            let matched = response
                .matched_index
                .unwrap_or(0)
                .min(self.last_log_index());
            if matched > current_match {
                self.match_index.insert(from, matched);
            }
            if matched + 1 > current_next {
                self.next_index.insert(from, matched + 1);
            }
            let advanced = self.advance_commit_index();
            if self.next_index.get(&from).copied().unwrap_or(0) <= self.last_log_index() {
                self.send_append_entries(from);
            }
            return advanced;
        }

        let mut next = current_next.saturating_sub(1);
        if let Some(hint) = response.conflict_index {
            next = next.min(hint);
        }
        let next = next.max(current_match + 1).max(1);
        debug!(node = self.id, peer = from, next_index = next, "backtracking peer");
        self.next_index.insert(from, next);
        if next < current_next {
            self.send_append_entries(from);
        }
        false
    }

    /// Commit the highest current-term index stored on a majority.
    ///
    /// Entries from earlier terms are only committed indirectly, through a
    /// later entry of the current term.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut candidate = self.last_log_index();
        while candidate > self.commit_index {
            if self.log.term_at(candidate) != Some(self.current_term) {
                break;
            }
            // the leader always holds its own entries
            let replicated = 1 + self
                .match_index
                .values()
                .filter(|matched| **matched >= candidate)
                .count();
            if replicated >= quorum {
                debug!(node = self.id, commit_index = candidate, "leader commit advanced");
                self.commit_index = candidate;
                return true;
            }
            candidate -= 1;
        }
        false
    }

    fn send_append_entries(&mut self, peer: NodeId) {
        if let Some(request) = self.create_append_entries(peer) {
            self.send(peer, RaftMessage::AppendEntries(request));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;
    use crate::message::RequestVoteResponse;

    /// Three-node leader at term 1 with the election no-op at index 1.
    fn leader() -> RaftNode {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.start_election();
        node.handle_vote_response(
            2,
            &RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        node.take_ready();
        node
    }

    fn ok(term: u64, matched: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term,
            success: true,
            matched_index: Some(matched),
            conflict_index: None,
        }
    }

    fn append(
        term: u64,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 2,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn follower_refuses_proposals() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.leader_id = Some(2);

        let err = node.propose(Command::Clear).unwrap_err();
        assert_eq!(
            err,
            RaftError::NotLeader {
                node_id: 1,
                leader_hint: Some(2)
            }
        );
    }

    #[test]
    fn proposal_is_logged_and_broadcast() {
        let mut node = leader();
        let index = node.propose(Command::set("k", "v")).unwrap();

        assert_eq!(index, 2);
        let ready = node.take_ready();
        assert_eq!(ready.log_ops.len(), 1);
        assert_eq!(ready.messages.len(), 2);
        match &ready.messages[0].message {
            RaftMessage::AppendEntries(req) => {
                assert_eq!(req.prev_log_index, 0);
                assert_eq!(req.entries.len(), 2);
            }
            other => panic!("expected AppendEntries, got {other:?}"),
        }
    }

    #[test]
    fn majority_ack_commits_current_term_entry() {
        let mut node = leader();
        node.propose(Command::set("k", "v")).unwrap();

        assert!(node.handle_append_entries_response(2, &ok(1, 2)));
        assert_eq!(node.commit_index, 2);
        assert_eq!(node.match_index.get(&2), Some(&2));
        assert_eq!(node.next_index.get(&2), Some(&3));
    }

    #[test]
    fn previous_term_entry_needs_current_term_entry_to_commit() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(1, Command::set("old", 1));
        node.current_term = 1;
        node.start_election(); // term 2
        node.handle_vote_response(
            2,
            &RequestVoteResponse {
                term: 2,
                vote_granted: true,
            },
        );

        // peer only has the term-1 entry
        assert!(!node.handle_append_entries_response(2, &ok(2, 1)));
        assert_eq!(node.commit_index, 0);

        // once the term-2 no-op is replicated both commit together
        assert!(node.handle_append_entries_response(2, &ok(2, 2)));
        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn rejection_backtracks_to_conflict_hint() {
        let mut node = leader();
        for i in 0..5 {
            node.propose(Command::set(format!("k{i}"), i)).unwrap();
        }
        node.next_index.insert(2, 7);
        node.take_ready();

        let rejected = AppendEntriesResponse {
            term: 1,
            success: false,
            matched_index: None,
            conflict_index: Some(3),
        };
        assert!(!node.handle_append_entries_response(2, &rejected));
        assert_eq!(node.next_index.get(&2), Some(&3));

        let ready = node.take_ready();
        match &ready.messages[0].message {
            RaftMessage::AppendEntries(req) => assert_eq!(req.prev_log_index, 2),
            other => panic!("expected AppendEntries, got {other:?}"),
        }
    }

    #[test]
    fn rejection_without_hint_steps_back_one() {
        let mut node = leader();
        node.next_index.insert(2, 5);
        let rejected = AppendEntriesResponse::rejected(1);
        node.handle_append_entries_response(2, &rejected);
        assert_eq!(node.next_index.get(&2), Some(&4));
    }

    #[test]
    fn higher_term_response_steps_leader_down() {
        let mut node = leader();
        node.handle_append_entries_response(2, &AppendEntriesResponse::rejected(5));

        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert!(node.next_index.is_empty());
    }

    #[test]
    fn stale_append_is_rejected_without_side_effects() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 5;

        let response = node.handle_append_entries(append(3, (0, 0), vec![], 0));
        assert!(!response.success);
        assert_eq!(response.term, 5);
        assert_eq!(node.leader_id, None);
    }

    #[test]
    fn candidate_yields_to_current_leader() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.start_election();

        let response = node.handle_append_entries(append(1, (0, 0), vec![], 0));
        assert!(response.success);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.leader_id, Some(2));
        // same term, vote is kept
        assert_eq!(node.voted_for, Some(1));
    }

    #[test]
    fn missing_prev_entry_returns_hint() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(1, Command::set("a", 1));

        let response = node.handle_append_entries(append(1, (4, 1), vec![], 0));
        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(2));
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(1, Command::set("a", 1));
        node.log.append(1, Command::set("b", 1));
        node.log.append(1, Command::set("c", 1));

        let entries = vec![
            LogEntry::new(2, 2, Command::set("b", 2)),
            LogEntry::new(2, 3, Command::set("x", 2)),
        ];
        let response = node.handle_append_entries(append(2, (1, 1), entries, 0));

        assert!(response.success);
        assert_eq!(response.matched_index, Some(3));
        assert_eq!(node.get_term_at(2), 2);
        assert_eq!(node.get_entry(3).unwrap().command, Command::set("x", 2));

        let ready = node.take_ready();
        assert_eq!(ready.log_ops[0], LogOp::TruncateFrom(2));
        assert!(matches!(&ready.log_ops[1], LogOp::Append(e) if e.len() == 2));
    }

    #[test]
    fn duplicate_append_does_not_truncate() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let first = vec![
            LogEntry::new(1, 1, Command::set("a", 1)),
            LogEntry::new(1, 2, Command::set("b", 1)),
        ];
        node.handle_append_entries(append(1, (0, 0), first.clone(), 0));
        node.take_ready();

        // an older, shorter request arriving late
        let response = node.handle_append_entries(append(1, (0, 0), first[..1].to_vec(), 0));
        assert!(response.success);
        assert_eq!(node.last_log_index(), 2);
        assert!(node.take_ready().log_ops.is_empty());
    }

    #[test]
    fn follower_commit_is_capped_and_monotonic() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let entries = vec![
            LogEntry::new(1, 1, Command::set("a", 1)),
            LogEntry::new(1, 2, Command::set("b", 1)),
        ];
        node.handle_append_entries(append(1, (0, 0), entries, 100));
        assert_eq!(node.commit_index, 2);

        // heartbeat that only vouches for index 1 must not move commit back
        node.handle_append_entries(append(1, (1, 1), vec![], 1));
        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn committed_entries_are_never_truncated() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(1, Command::set("a", 1));
        node.commit_index = 1;

        let entries = vec![LogEntry::new(2, 1, Command::set("a", 2))];
        let response = node.handle_append_entries(append(2, (0, 0), entries, 0));

        assert!(!response.success);
        assert_eq!(node.get_term_at(1), 1);
    }

    #[test]
    fn leader_never_rewrites_its_own_log() {
        let mut node = leader();
        node.propose(Command::set("k", "v")).unwrap();
        let before = node.log.clone();

        let entries = vec![LogEntry::new(1, 1, Command::Clear)];
        let response = node.handle_append_entries(append(1, (0, 0), entries, 0));

        assert!(!response.success);
        assert!(node.is_leader());
        assert_eq!(node.log, before);
    }

    #[test]
    fn fresh_leader_sends_noop_to_peers() {
        let node = leader();
        let request = node.create_append_entries(2).unwrap();
        assert_eq!(request.prev_log_index, 0);
        assert_eq!(request.entries.len(), 1);

        let follower = RaftNode::new(2, vec![1, 2, 3]);
        assert!(follower.create_append_entries(1).is_none());
    }
}
