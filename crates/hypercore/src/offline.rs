//! Offline queue wrapping a log store (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use hyperforge_common::{new_id, now_ms};
use hyperforge_types::log::Entry;
use serde_json::Value;

use crate::log_store::LogStore;

#[derive(Debug, Clone)]
pub struct QueuedOp {
    pub id: String,
    pub store_name: String,
    pub data: Value,
    pub queued_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub last_synced_seq: u64,
    pub synced_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DrainResult {
    pub replayed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

struct Inner {
    is_online: bool,
    queue: VecDeque<QueuedOp>,
    total_drained: u64,
    total_failed: u64,
    sync_states: HashMap<(String, String), SyncState>,
}

pub struct OfflineQueue {
    store: Arc<LogStore>,
    store_name: String,
    inner: Mutex<Inner>,
}

impl OfflineQueue {
    pub fn new(store_name: impl Into<String>, store: Arc<LogStore>) -> Self {
        Self {
            store,
            store_name: store_name.into(),
            inner: Mutex::new(Inner {
                is_online: true,
                queue: VecDeque::new(),
                total_drained: 0,
                total_failed: 0,
                sync_states: HashMap::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().unwrap().is_online
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn total_drained(&self) -> u64 {
        self.inner.lock().unwrap().total_drained
    }

    pub fn total_failed(&self) -> u64 {
        self.inner.lock().unwrap().total_failed
    }

    /// Online: delegates directly and returns the append result. Offline:
    /// enqueues in FIFO order and returns `None`.
    pub fn append(&self, data: Value) -> Option<Result<crate::log_store::Appended, hyperforge_types::HyperforgeError>> {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_online {
            drop(guard);
            return Some(self.store.append(data));
        }
        guard.queue.push_back(QueuedOp {
            id: new_id(),
            store_name: self.store_name.clone(),
            data,
            queued_at: now_ms(),
        });
        None
    }

    /// Reads always bypass the queue.
    pub fn get(&self, seq: u64) -> Result<Entry, hyperforge_types::HyperforgeError> {
        self.store.get(seq)
    }

    /// Transitioning offline -> online auto-drains. Transitioning to
    /// offline (or a no-op transition) does nothing else.
    pub fn set_online(&self, online: bool) -> Option<DrainResult> {
        let was_offline = {
            let mut guard = self.inner.lock().unwrap();
            let was_offline = !guard.is_online;
            guard.is_online = online;
            was_offline
        };
        if online && was_offline {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Replays queued ops in FIFO order. On first failure the replay
    /// halts: the failing op is consumed (counted failed) and the
    /// remaining ops stay queued for a later `drain()` call (spec §9 open
    /// question: no documented retry policy, so this preserves
    /// halt-on-first-failure rather than inventing a dead-letter queue).
    pub fn drain(&self) -> DrainResult {
        let mut result = DrainResult::default();
        loop {
            let next = {
                let mut guard = self.inner.lock().unwrap();
                guard.queue.pop_front()
            };
            let Some(op) = next else { break };
            match self.store.append(op.data) {
                Ok(_) => {
                    result.replayed += 1;
                    let mut guard = self.inner.lock().unwrap();
                    guard.total_drained += 1;
                }
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(e.to_string());
                    let mut guard = self.inner.lock().unwrap();
                    guard.total_failed += 1;
                    break;
                }
            }
        }
        result
    }

    pub fn record_sync_state(&self, log: &str, peer: &str, last_synced_seq: u64) {
        let mut guard = self.inner.lock().unwrap();
        guard.sync_states.insert(
            (log.to_string(), peer.to_string()),
            SyncState {
                last_synced_seq,
                synced_at: now_ms(),
            },
        );
    }

    pub fn get_last_synced_seq(&self, log: &str, peer: &str) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .sync_states
            .get(&(log.to_string(), peer.to_string()))
            .map(|s| s.last_synced_seq)
    }
}
