//! # config
//!
//! why: raft timing knobs shared by the core and the host runtime
//! relations: consumed by node.rs and timer.rs, embedded in kvraft-node's NodeConfig
//! what: RaftConfig with defaults and validation

use crate::error::RaftError;
use serde::{Deserialize, Serialize};

/// Timing and batching parameters, in milliseconds of logical time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    /// Must stay below `election_timeout_min` so a live leader suppresses elections.
    pub heartbeat_interval: u64,
    /// Upper bound on entries carried by one AppendEntries request.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be non-zero and below the minimum election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max_entries_per_append must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
