//! # cache
//!
//! why: the replicated state machine - a key/value cache with optional ttl
//! relations: fed committed entries by kvraft-node's event loop, read locally on any role
//! what: CacheStateMachine (apply / get / keys / stats), CacheEntry, Clock abstraction

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::command::Command;
use crate::error::RaftError;
use crate::log::LogEntry;
use crate::LogIndex;

/// Wall-clock source for ttl expiry, in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Unix millis after which the entry reads as absent.
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.map_or(false, |at| now_millis > at)
    }
}

/// Node-local counters; reads differ per node so these are never replicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub clears: u64,
    pub expirations: u64,
    /// Percentage of reads that hit, rounded to two decimals.
    pub hit_rate: f64,
}

pub struct CacheStateMachine {
    entries: HashMap<String, CacheEntry>,
    last_applied: LogIndex,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CacheStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStateMachine")
            .field("len", &self.entries.len())
            .field("last_applied", &self.last_applied)
            .finish()
    }
}

impl Default for CacheStateMachine {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl CacheStateMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            last_applied: 0,
            stats: CacheStats::default(),
            clock,
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Apply one committed entry. Already-applied indexes are skipped
    /// (`Ok(false)`); a gap is an error.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<bool, RaftError> {
        if entry.index <= self.last_applied {
            return Ok(false);
        }
        if entry.index != self.last_applied + 1 {
            return Err(RaftError::NonContiguousEntry {
                expected: self.last_applied + 1,
                got: entry.index,
            });
        }

        match &entry.command {
            Command::Set {
                key,
                value,
                ttl_secs,
            } => {
                let expires_at = ttl_secs.map(|ttl| {
                    self.clock
                        .now_millis()
                        .saturating_add(ttl.saturating_mul(1_000))
                });
                self.entries.insert(
                    key.clone(),
                    CacheEntry {
                        key: key.clone(),
                        value: value.clone(),
                        expires_at,
                    },
                );
                self.stats.sets += 1;
            }
            Command::Delete { key } => {
                if self.entries.remove(key).is_some() {
                    self.stats.deletes += 1;
                }
            }
            Command::Clear => {
                self.entries.clear();
                self.stats.clears += 1;
            }
            Command::Noop => {}
        }
        trace!(index = entry.index, "applied entry to cache");
        self.last_applied = entry.index;
        Ok(true)
    }

    /// Read `key`, dropping it if its ttl has passed.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                self.entries.remove(key);
                self.stats.expirations += 1;
                self.stats.misses += 1;
                None
            }
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Live keys, sorted. Expired entries are purged on the way.
    pub fn keys(&mut self) -> Vec<String> {
        self.purge_expired();
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let reads = self.stats.hits + self.stats.misses;
        let hit_rate = if reads == 0 {
            0.0
        } else {
            (self.stats.hits as f64 / reads as f64 * 10_000.0).round() / 100.0
        };
        CacheStats {
            size: self.len(),
            hit_rate,
            ..self.stats.clone()
        }
    }

    fn purge_expired(&mut self) {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.stats.expirations += (before - self.entries.len()) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine() -> (CacheStateMachine, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (CacheStateMachine::new(Arc::new(clock.clone())), clock)
    }

    fn entry(index: u64, command: Command) -> LogEntry {
        LogEntry::new(1, index, command)
    }

    #[test]
    fn set_then_get() {
        let (mut cache, _) = machine();
        cache.apply(&entry(1, Command::set("k", json!({"a": 1})))).unwrap();

        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn delete_and_clear() {
        let (mut cache, _) = machine();
        cache.apply(&entry(1, Command::set("a", 1))).unwrap();
        cache.apply(&entry(2, Command::set("b", 2))).unwrap();
        cache.apply(&entry(3, Command::delete("a"))).unwrap();
        // deleting an absent key is a no-op
        cache.apply(&entry(4, Command::delete("a"))).unwrap();

        assert_eq!(cache.keys(), vec!["b".to_string()]);

        cache.apply(&entry(5, Command::Clear)).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().deletes, 1);
    }

    #[test]
    fn reapplying_an_index_is_ignored() {
        let (mut cache, _) = machine();
        let first = entry(1, Command::set("k", "v1"));
        assert!(cache.apply(&first).unwrap());
        cache.apply(&entry(2, Command::set("k", "v2"))).unwrap();

        assert!(!cache.apply(&first).unwrap());
        assert_eq!(cache.get("k"), Some(json!("v2")));
    }

    #[test]
    fn gaps_are_refused() {
        let (mut cache, _) = machine();
        let err = cache.apply(&entry(2, Command::Clear)).unwrap_err();
        assert_eq!(err, RaftError::NonContiguousEntry { expected: 1, got: 2 });
    }

    #[test]
    fn ttl_expires_lazily_on_read() {
        let (mut cache, clock) = machine();
        cache.apply(&entry(1, Command::set_with_ttl("session", "s", 1))).unwrap();

        clock.advance(500);
        assert_eq!(cache.get("session"), Some(json!("s")));

        clock.advance(1_500);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get("session"), None);
        assert_eq!(cache.stats().expirations, 1);
        // nothing new was applied for the expiry
        assert_eq!(cache.last_applied(), 1);
    }

    #[test]
    fn noop_advances_cursor_only() {
        let (mut cache, _) = machine();
        cache.apply(&entry(1, Command::Noop)).unwrap();
        assert_eq!(cache.last_applied(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_track_hit_rate() {
        let (mut cache, _) = machine();
        cache.apply(&entry(1, Command::set("k", "v"))).unwrap();
        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("nope");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate, 75.0);
    }
}
