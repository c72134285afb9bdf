//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, read by replication.rs, persisted via kvraft-storage
//! what: LogEntry, RaftLog (append, truncate, range reads, consistency checks)

use crate::command::Command;
use crate::error::RaftError;
use crate::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// The command to be applied to the state machine
    pub command: Command,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self { term, index, command }
    }
}

/// Contiguous sequence of entries; `entries[i].index == i + 1` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, RaftError> {
        let mut log = Self::new();
        for entry in entries {
            log.push(entry)?;
        }
        Ok(log)
    }

    /// Append a command at the next index.
    pub fn append(&mut self, term: Term, command: Command) -> LogEntry {
        let entry = LogEntry::new(term, self.last_index() + 1, command);
        self.entries.push(entry.clone());
        entry
    }

    /// Append an entry built elsewhere (replicated from the leader or loaded from disk).
    pub fn push(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::NonContiguousEntry {
                expected,
                got: entry.index,
            });
        }
        if entry.term < self.last_term() {
            return Err(RaftError::StaleTerm {
                received: entry.term,
                current: self.last_term(),
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove every entry at or after `index`, returning them.
    pub fn truncate_from(&mut self, index: LogIndex) -> Vec<LogEntry> {
        let keep = index.saturating_sub(1) as usize;
        if keep >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(keep)
    }

    /// Entries in `[from, to)`, clamped to what the log holds.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> &[LogEntry] {
        let start = (from.max(1) - 1) as usize;
        let end = (to.saturating_sub(1) as usize).min(self.entries.len());
        if start >= end {
            return &[];
        }
        &self.entries[start..end]
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let to = from.saturating_add(max as u64);
        self.range(from, to).to_vec()
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// AppendEntries consistency check: do we hold `index` with `term`?
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Where the leader should retry from after a failed check at `prev_index`.
    ///
    /// Too short: our next free slot. Otherwise: the first entry of the term
    /// that conflicts, so a whole stale term is skipped in one round trip.
    pub fn conflict_hint(&self, prev_index: LogIndex) -> LogIndex {
        let Some(conflict_term) = self.term_at(prev_index).filter(|_| prev_index > 0) else {
            return self.last_index() + 1;
        };
        let mut first = prev_index;
        while first > 1 && self.term_at(first - 1) == Some(conflict_term) {
            first -= 1;
        }
        first
    }

    /// `(last_term, last_index)` ordering used for the vote "up-to-date" check.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
