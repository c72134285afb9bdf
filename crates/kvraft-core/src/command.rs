//! # command
//!
//! why: define the cache mutations that flow through the replicated log
//! relations: carried by log.rs entries, applied by cache.rs
//! what: Command enum (set, delete, clear, noop) with the json shape used on the wire

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cache mutation. Only committed commands ever reach the cache.
///
/// Serialized with an `operation` tag, e.g.
/// `{"operation":"set","key":"k","value":"v","ttl":30}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Command {
    /// Insert or overwrite `key`, optionally expiring `ttl_secs` after it is applied.
    Set {
        key: String,
        value: Value,
        #[serde(rename = "ttl", default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },
    /// Remove `key` if present.
    Delete { key: String },
    /// Remove every key.
    Clear,
    /// Appended by a new leader so entries from earlier terms can commit.
    /// Has no effect on the cache.
    Noop,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl_secs: None,
        }
    }

    pub fn set_with_ttl(key: impl Into<String>, value: impl Into<Value>, ttl_secs: u64) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl_secs: Some(ttl_secs),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// The key this command touches, `None` for `Clear` and `Noop`.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => Some(key),
            Self::Clear | Self::Noop => None,
        }
    }
}
