//! # kvraft-storage
//!
//! why: durable persistence for raft term, vote and log so a node survives restarts
//! relations: fed Ready batches by kvraft-node's event loop, rebuilt into RaftNode::restore
//! what: Storage trait, FileStorage (atomic meta + append-only jsonl log), InMemoryStorage

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use kvraft_core::{HardState, LogEntry, LogIndex, LogOp, PersistentState, Ready};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode or decode persisted state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt log file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// trait for durable storage of raft state
///
/// every write must be durable before it returns: the event loop answers
/// rpcs only after `persist` succeeds.
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()>;

    /// load the persisted term and voted_for (defaults for a fresh node)
    fn load_hard_state(&self) -> Result<HardState>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// drop every entry at or after `from_index` (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<()>;

    /// everything RaftNode::restore needs
    fn load_state(&self) -> Result<PersistentState> {
        Ok(PersistentState {
            hard_state: self.load_hard_state()?,
            log: self.load_log()?,
        })
    }

    /// write one Ready batch: hard state first, then log ops in order
    fn persist(&mut self, ready: &Ready) -> Result<()> {
        if let Some(hard_state) = &ready.hard_state {
            self.save_hard_state(hard_state)?;
        }
        for op in &ready.log_ops {
            match op {
                LogOp::Append(entries) => self.append_entries(entries)?,
                LogOp::TruncateFrom(index) => self.truncate_log_from(*index)?,
            }
        }
        Ok(())
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one log entry per line, appended and fsynced
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// open (or create) storage rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let storage = Self { dir };
        storage.drop_torn_tail()?;
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// cut an unreadable trailing record left by a crash mid-append, so the
    /// file holds exactly what `load_log` returns and the next append starts
    /// on a fresh line
    fn drop_torn_tail(&self) -> Result<()> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }
        let contents = fs::read(&path)?;
        if contents.is_empty() {
            return Ok(());
        }
        let terminated = contents.last() == Some(&b'\n');
        let body = contents.strip_suffix(b"\n").unwrap_or(&contents[..]);
        let keep = body
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        let last = &body[keep..];
        let readable = last.iter().all(u8::is_ascii_whitespace)
            || serde_json::from_slice::<LogEntry>(last).is_ok();
        if terminated && readable {
            return Ok(());
        }
        warn!(
            path = %path.display(),
            dropped_bytes = contents.len() - keep,
            "dropping torn trailing log record"
        );
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(keep as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// atomic write: write to temp file, fsync, rename over `target`, then
    /// fsync the directory so the rename itself is durable
    fn write_atomic(&self, target: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = target.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        self.sync_dir()
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    // directories cannot be opened for syncing here
    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        let json = serde_json::to_vec_pretty(hard_state)?;
        self.write_atomic(&self.meta_path(), &json)
    }

    fn load_hard_state(&self) -> Result<HardState> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(HardState::default());
        }
        let contents = fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&buf)?;
        file.sync_data()?;
        debug!(
            dir = %self.dir.display(),
            first = entries[0].index,
            count = entries.len(),
            "appended log entries"
        );
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let lines: Vec<String> = reader.lines().collect::<io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut log = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => log.push(entry),
                // a crash mid-append leaves at most one partial trailing line
                Err(err) if number == last => {
                    warn!(path = %path.display(), %err, "dropping torn trailing log record");
                }
                Err(err) => {
                    return Err(StorageError::Corrupt {
                        path,
                        reason: format!("line {}: {err}", number + 1),
                    });
                }
            }
        }
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<()> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);

        let mut buf = Vec::new();
        for entry in &log {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.write_atomic(&self.log_path(), &buf)?;
        debug!(
            dir = %self.dir.display(),
            from_index,
            removed = before - log.len(),
            "truncated log"
        );
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// clones are independent; nothing survives the process
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        self.hard_state = *hard_state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.hard_state = HardState::default();
        self.log.clear();
        Ok(())
    }
}
