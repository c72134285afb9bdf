//! # config
//!
//! why: everything a node needs to join a fixed cluster
//! relations: wraps kvraft-core's RaftConfig; read by runtime.rs at spawn
//! what: NodeConfig with defaults, validation and duration helpers

use std::time::Duration;

use kvraft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Every member of the cluster, this node included. Fixed at startup.
    pub members: Vec<NodeId>,
    pub raft: RaftConfig,
    /// How often the event loop advances the raft clock.
    pub tick_interval_ms: u64,
    /// Upper bound on a single RequestVote or AppendEntries call.
    pub rpc_timeout_ms: u64,
    /// How long a write waits for commit before reporting QuorumUnavailable.
    pub commit_timeout_ms: u64,
    /// Outbound messages buffered per peer before new ones are dropped.
    pub peer_queue_depth: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            members: vec![1],
            raft: RaftConfig::default(),
            tick_interval_ms: 10,
            rpc_timeout_ms: 2_000,
            commit_timeout_ms: 5_000,
            peer_queue_depth: 64,
        }
    }
}

impl NodeConfig {
    pub fn new(id: NodeId, members: Vec<NodeId>) -> Self {
        Self {
            id,
            members,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.members.is_empty() {
            return Err(NodeError::Config("cluster membership is empty".into()));
        }
        if !self.members.contains(&self.id) {
            return Err(NodeError::Config(format!(
                "node {} is not in the member list {:?}",
                self.id, self.members
            )));
        }
        let mut unique = self.members.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != self.members.len() {
            return Err(NodeError::Config(format!(
                "duplicate ids in member list {:?}",
                self.members
            )));
        }
        if self.tick_interval_ms == 0 || self.rpc_timeout_ms == 0 || self.commit_timeout_ms == 0 {
            return Err(NodeError::Config(
                "tick, rpc and commit timeouts must be non-zero".into(),
            ));
        }
        if self.peer_queue_depth == 0 {
            return Err(NodeError::Config("peer_queue_depth must be at least 1".into()));
        }
        self.raft
            .validate()
            .map_err(|err| NodeError::Config(err.to_string()))
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |id| *id != self.id)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts() {
        let config = NodeConfig::new(2, vec![1, 2, 3]);
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc_timeout(), Duration::from_secs(2));
        assert_eq!(config.peers().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn rejects_bad_membership() {
        assert!(NodeConfig::new(1, vec![]).validate().is_err());
        assert!(NodeConfig::new(4, vec![1, 2, 3]).validate().is_err());
        assert!(NodeConfig::new(1, vec![1, 2, 2]).validate().is_err());
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let mut config = NodeConfig::new(1, vec![1, 2, 3]);
        config.raft.heartbeat_interval = config.raft.election_timeout_min;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"id": 3, "members": [1, 2, 3], "raft": {"heartbeat_interval": 30}}"#)
                .unwrap();
        assert_eq!(config.id, 3);
        assert_eq!(config.raft.heartbeat_interval, 30);
        assert_eq!(config.raft.election_timeout_max, 300);
        assert_eq!(config.commit_timeout_ms, 5_000);
    }
}
