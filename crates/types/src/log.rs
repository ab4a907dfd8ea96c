//! Append-only log data model (spec §3 "Log Entry", "Log").

use serde::{Deserialize, Serialize};

/// Default payload ceiling for a single log entry: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// A single immutable, hash-chained log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub seq: u64,
    /// Hex-encoded SHA-256 of `(seq, prev_hash, canonical_json(data))`.
    pub hash: String,
    pub timestamp: u64,
    pub byte_length: u32,
    pub data: serde_json::Value,
}

/// Metadata describing a named log (spec §3 "Log").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogMeta {
    pub name: String,
    pub public_key: String,
    pub length: u64,
    pub byte_length: u64,
    pub writable: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl LogMeta {
    pub fn new(name: impl Into<String>, public_key: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            length: 0,
            byte_length: 0,
            writable: true,
            created_at: now,
            updated_at: now,
        }
    }
}
