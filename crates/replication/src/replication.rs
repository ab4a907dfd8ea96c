//! Replication Manager (spec §4.2).
//!
//! The core does not arbitrate divergent histories at the same `seq`:
//! when a Merkle-root comparison finds a mismatch, the manager pushes its
//! local suffix, pulls the remote suffix, and reports whatever the
//! resulting comparison says (`merkle_valid`) — reconciliation of true
//! divergence is left to a higher layer (the CRDT bridge does this by
//! timestamp ordering).

use std::collections::HashMap;
use std::sync::RwLock;

use hyperforge_common::{merkle_root, now_ms};
use hyperforge_hypercore::Corestore;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub logs_replicated: u64,
    pub active: bool,
    pub connected_at: u64,
}

#[derive(Debug, Clone)]
pub struct LogSyncResult {
    pub log_name: String,
    pub entries_received: usize,
    pub entries_sent: usize,
    pub merkle_valid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationState {
    pub peer_count: usize,
    pub active_peer_count: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_logs_replicated: u64,
}

struct Inner {
    peers: HashMap<String, PeerRecord>,
    last_synced_seq: HashMap<(String, String), u64>,
}

pub struct ReplicationManager {
    local: std::sync::Arc<Corestore>,
    inner: RwLock<Inner>,
}

impl ReplicationManager {
    pub fn new(local: std::sync::Arc<Corestore>) -> Self {
        Self {
            local,
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                last_synced_seq: HashMap::new(),
            }),
        }
    }

    pub fn add_peer(&self, id: impl Into<String>, address: impl Into<String>) {
        let id = id.into();
        self.inner.write().unwrap().peers.insert(
            id.clone(),
            PeerRecord {
                peer_id: id,
                address: address.into(),
                bytes_sent: 0,
                bytes_received: 0,
                logs_replicated: 0,
                active: true,
                connected_at: now_ms(),
            },
        );
    }

    pub fn remove_peer(&self, id: &str) {
        self.inner.write().unwrap().peers.remove(id);
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.read().unwrap().peers.values().cloned().collect()
    }

    /// Syncs every log shared between `self` and `remote`, reconciling by
    /// the Merkle-diff algorithm from spec §4.2.
    pub fn sync(&self, peer_id: &str, remote: &Corestore) -> Vec<LogSyncResult> {
        let local_names: std::collections::HashSet<_> = self.local.names().into_iter().collect();
        let remote_names: std::collections::HashSet<_> = remote.names().into_iter().collect();
        let shared = local_names.intersection(&remote_names);

        let mut results = Vec::new();
        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;
        let mut logs_replicated = 0u64;

        for name in shared {
            let local_log = self.local.get(name);
            let remote_log = remote.get(name);

            let local_hashes = local_log.hashes();
            let remote_hashes = remote_log.hashes();
            let local_root = merkle_root(&local_hashes);
            let remote_root = merkle_root(&remote_hashes);

            if local_root == remote_root {
                results.push(LogSyncResult {
                    log_name: name.clone(),
                    entries_received: 0,
                    entries_sent: 0,
                    merkle_valid: true,
                });
                continue;
            }

            // Linear scan for the first point of divergence, up to the
            // shared prefix length.
            let min_len = local_hashes.len().min(remote_hashes.len());
            let mut divergence = min_len;
            for i in 0..min_len {
                if local_hashes[i] != remote_hashes[i] {
                    divergence = i;
                    break;
                }
            }

            let local_suffix = local_log.export_entries(divergence as u64);
            let remote_suffix = remote_log.export_entries(divergence as u64);

            let entries_sent = remote_log.import_entries(&local_suffix);
            let entries_received = local_log.import_entries(&remote_suffix);

            bytes_sent += local_suffix
                .iter()
                .take(entries_sent)
                .map(|e| e.byte_length as u64)
                .sum::<u64>();
            bytes_received += remote_suffix
                .iter()
                .take(entries_received)
                .map(|e| e.byte_length as u64)
                .sum::<u64>();
            logs_replicated += 1;

            let new_local_root = merkle_root(&local_log.hashes());
            let new_remote_root = merkle_root(&remote_log.hashes());

            results.push(LogSyncResult {
                log_name: name.clone(),
                entries_received,
                entries_sent,
                merkle_valid: new_local_root == new_remote_root,
            });
        }

        let mut guard = self.inner.write().unwrap();
        if let Some(peer) = guard.peers.get_mut(peer_id) {
            peer.bytes_sent += bytes_sent;
            peer.bytes_received += bytes_received;
            peer.logs_replicated += logs_replicated;
        }
        for r in &results {
            guard
                .last_synced_seq
                .insert((r.log_name.clone(), peer_id.to_string()), {
                    self.local.get(&r.log_name).length()
                });
        }

        results
    }

    pub fn get_replication_state(&self) -> ReplicationState {
        let guard = self.inner.read().unwrap();
        let mut state = ReplicationState::default();
        state.peer_count = guard.peers.len();
        for p in guard.peers.values() {
            if p.active {
                state.active_peer_count += 1;
            }
            state.total_bytes_sent += p.bytes_sent;
            state.total_bytes_received += p.bytes_received;
            state.total_logs_replicated += p.logs_replicated;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn sync_is_no_op_when_roots_already_match() {
        let a = Arc::new(Corestore::default());
        let b = Arc::new(Corestore::default());
        a.get("shared").append(json!({"x": 1})).unwrap();
        b.get("shared").append(json!({"x": 1})).unwrap();

        let mgr = ReplicationManager::new(a.clone());
        mgr.add_peer("peer-b", "mem://b");
        let results = mgr.sync("peer-b", &b);
        assert_eq!(results.len(), 1);
        assert!(results[0].merkle_valid);
        assert_eq!(results[0].entries_sent, 0);
        assert_eq!(results[0].entries_received, 0);
    }

    #[test]
    fn l4_sync_converges_on_shared_prefix() {
        let a = Arc::new(Corestore::default());
        let b = Arc::new(Corestore::default());
        let log_a = a.get("shared");
        log_a.append(json!({"x": 1})).unwrap();
        log_a.append(json!({"x": 2})).unwrap();
        let exported = log_a.export_entries(0);
        b.get("shared").import_entries(&exported[..1]);
        log_a.append(json!({"x": 3})).unwrap();

        let mgr = ReplicationManager::new(a.clone());
        mgr.add_peer("peer-b", "mem://b");
        let results = mgr.sync("peer-b", &b);
        assert_eq!(results.len(), 1);
        assert!(results[0].merkle_valid);
        assert_eq!(b.get("shared").length(), a.get("shared").length());
    }

    #[test]
    fn scenario_3_sync_divergence_is_reported() {
        let a = Arc::new(Corestore::default());
        let b = Arc::new(Corestore::default());
        a.get("shared").append(json!({"v": "h1"})).unwrap();
        a.get("shared").append(json!({"v": "h2"})).unwrap();

        b.get("shared").append(json!({"v": "h1"})).unwrap();
        b.get("shared").append(json!({"v": "h2-prime"})).unwrap();
        b.get("shared").append(json!({"v": "h3"})).unwrap();

        let mgr = ReplicationManager::new(a.clone());
        mgr.add_peer("peer-b", "mem://b");
        let results = mgr.sync("peer-b", &b);
        assert_eq!(results.len(), 1);
        assert!(!results[0].merkle_valid);
    }
}
