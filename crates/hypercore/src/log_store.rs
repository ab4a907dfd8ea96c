//! The append-only log store (spec §4.1).
//!
//! Appends are serialized behind a single mutex: only one append executes
//! at a time on a given log, and it is atomic — either `length` increases
//! by one and the new entry becomes visible, or nothing changes (spec §5).
//! Reads take a read lock and observe a consistent `[0..length)` snapshot;
//! they never suspend since the store is purely in-memory.

use std::sync::RwLock;

use hyperforge_common::{canonical_json_bytes, now_ms, sha256_hex};
use hyperforge_types::log::{Entry, LogMeta, DEFAULT_MAX_PAYLOAD_BYTES};
use hyperforge_types::{ErrorCode, HyperforgeError};
use serde_json::Value;

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct Appended {
    pub seq: u64,
    pub hash: String,
    pub byte_length: u32,
}

struct Inner {
    meta: LogMeta,
    entries: Vec<Entry>,
}

/// A single named, hash-chained append-only log.
pub struct LogStore {
    max_payload_bytes: usize,
    inner: RwLock<Inner>,
}

impl LogStore {
    pub fn new(name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self::with_max_payload_bytes(name, public_key, DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_payload_bytes(
        name: impl Into<String>,
        public_key: impl Into<String>,
        max_payload_bytes: usize,
    ) -> Self {
        let now = now_ms();
        Self {
            max_payload_bytes,
            inner: RwLock::new(Inner {
                meta: LogMeta::new(name, public_key, now),
                entries: Vec::new(),
            }),
        }
    }

    pub fn meta(&self) -> LogMeta {
        self.inner.read().unwrap().meta.clone()
    }

    pub fn length(&self) -> u64 {
        self.inner.read().unwrap().entries.len() as u64
    }

    fn entry_hash(seq: u64, prev_hash: &str, data: &Value) -> String {
        let serialised = canonical_json_bytes(data);
        sha256_hex(&[&seq.to_be_bytes(), prev_hash.as_bytes(), &serialised])
    }

    /// Append `data`, rejecting oversized payloads and committing
    /// atomically.
    pub fn append(&self, data: Value) -> Result<Appended, HyperforgeError> {
        let serialised = canonical_json_bytes(&data);
        if serialised.len() > self.max_payload_bytes {
            return Err(HyperforgeError::PayloadTooLarge {
                actual: serialised.len(),
                limit: self.max_payload_bytes,
            });
        }
        let mut guard = self.inner.write().unwrap();
        let seq = guard.entries.len() as u64;
        let prev_hash = guard
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_default();
        let hash = Self::entry_hash(seq, &prev_hash, &data);
        let byte_length = serialised.len() as u32;
        let now = now_ms();
        let entry = Entry {
            seq,
            hash: hash.clone(),
            timestamp: now,
            byte_length,
            data,
        };
        guard.entries.push(entry);
        guard.meta.length = guard.entries.len() as u64;
        guard.meta.byte_length += byte_length as u64;
        guard.meta.updated_at = now;
        Ok(Appended {
            seq,
            hash,
            byte_length,
        })
    }

    pub fn get(&self, seq: u64) -> Result<Entry, HyperforgeError> {
        let guard = self.inner.read().unwrap();
        guard
            .entries
            .get(seq as usize)
            .cloned()
            .ok_or(HyperforgeError::OutOfRange {
                seq,
                length: guard.entries.len() as u64,
            })
    }

    /// Half-open range `[start, end)`.
    pub fn range(&self, start: u64, end: u64) -> Result<Vec<Entry>, HyperforgeError> {
        let guard = self.inner.read().unwrap();
        let length = guard.entries.len() as u64;
        if start > length || end > length || start > end {
            return Err(HyperforgeError::OutOfRange { seq: end, length });
        }
        Ok(guard.entries[start as usize..end as usize].to_vec())
    }

    /// Recompute every hash from `from_seq` forward; returns `false` on the
    /// first mismatch.
    pub fn verify_chain(&self, from_seq: u64) -> bool {
        let guard = self.inner.read().unwrap();
        let start = from_seq as usize;
        if start > guard.entries.len() {
            return true;
        }
        for i in start..guard.entries.len() {
            let prev_hash = if i == 0 {
                String::new()
            } else {
                guard.entries[i - 1].hash.clone()
            };
            let expected = Self::entry_hash(i as u64, &prev_hash, &guard.entries[i].data);
            if expected != guard.entries[i].hash {
                return false;
            }
        }
        true
    }

    /// Verify a single entry's hash against its predecessor, i.e. one step
    /// of the chain (the log has no detached per-entry signatures; its
    /// "signature" is the hash-chain link itself).
    pub fn verify_signature(&self, seq: u64) -> Result<bool, HyperforgeError> {
        let guard = self.inner.read().unwrap();
        let length = guard.entries.len() as u64;
        if seq >= length {
            return Err(HyperforgeError::OutOfRange { seq, length });
        }
        let idx = seq as usize;
        let prev_hash = if idx == 0 {
            String::new()
        } else {
            guard.entries[idx - 1].hash.clone()
        };
        let expected = Self::entry_hash(seq, &prev_hash, &guard.entries[idx].data);
        Ok(expected == guard.entries[idx].hash)
    }

    pub fn export_entries(&self, from_seq: u64) -> Vec<Entry> {
        let guard = self.inner.read().unwrap();
        let start = (from_seq as usize).min(guard.entries.len());
        guard.entries[start..].to_vec()
    }

    /// Accepts only the strict continuation: entries whose `seq` equals the
    /// current length, in order. The scan halts at the first entry that
    /// doesn't continue the chain, so a batch with entries out of order only
    /// imports its in-order prefix (spec §4.1, open question in §9 resolved
    /// as "stop at first discontinuity").
    pub fn import_entries(&self, entries: &[Entry]) -> usize {
        let mut guard = self.inner.write().unwrap();
        let mut imported = 0usize;
        for entry in entries {
            let expected_seq = guard.entries.len() as u64;
            if entry.seq != expected_seq {
                tracing::debug!(
                    seq = entry.seq,
                    expected = expected_seq,
                    "halting import at first out-of-order entry"
                );
                break;
            }
            guard.meta.byte_length += entry.byte_length as u64;
            guard.entries.push(entry.clone());
            imported += 1;
        }
        if imported > 0 {
            guard.meta.length = guard.entries.len() as u64;
            guard.meta.updated_at = now_ms();
        }
        imported
    }

    /// A streaming iterator over a snapshot of the current entries,
    /// starting at `from_seq`.
    pub fn iter_from(&self, from_seq: u64) -> EntryIter {
        EntryIter {
            entries: self.export_entries(from_seq),
            pos: 0,
        }
    }

    pub fn hashes(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.hash.clone())
            .collect()
    }
}

pub struct EntryIter {
    entries: Vec<Entry>,
    pos: usize,
}

impl Iterator for EntryIter {
    type Item = Entry;
    fn next(&mut self) -> Option<Entry> {
        let item = self.entries.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

/// Error code helper so callers that only care about the discriminant
/// don't have to pattern-match the full error.
pub fn is_payload_too_large(err: &HyperforgeError) -> bool {
    err.code() == ErrorCode::PayloadTooLarge
}
