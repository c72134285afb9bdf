//! # timer
//!
//! why: randomized election timeouts without tying the core to a real clock
//! relations: owned by node.rs, advanced through RaftNode::tick
//! what: ElectionTimer over logical milliseconds with a seedable rng

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deadline-based election timer.
///
/// Time is whatever millisecond counter the host feeds into `RaftNode::tick`,
/// so tests can jump straight past a deadline.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: u64,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self::with_rng(min_ms, max_ms, StdRng::from_entropy())
    }

    /// Deterministic timeouts for reproducible tests.
    pub fn seeded(min_ms: u64, max_ms: u64, seed: u64) -> Self {
        Self::with_rng(min_ms, max_ms, StdRng::seed_from_u64(seed))
    }

    fn with_rng(min_ms: u64, max_ms: u64, mut rng: StdRng) -> Self {
        let deadline = rng.gen_range(min_ms..=max_ms.max(min_ms));
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            deadline,
            rng,
        }
    }

    /// Re-roll the timeout and count it from `now`.
    pub fn reset(&mut self, now: u64) {
        let timeout = self.rng.gen_range(self.min_ms..=self.max_ms);
        self.deadline = now.saturating_add(timeout);
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}
