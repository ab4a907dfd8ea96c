//! ATLAS memory adapter (spec §4.6): a typed memory-node log plus a
//! multi-index over it for agent memory retrieval.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use hyperforge_common::canonical_json_bytes;
use hyperforge_hypercore::LogStore;
use hyperforge_types::memory::MemoryNode;
use hyperforge_types::{ErrorCode, HyperforgeError};

const TIME_BUCKET_MS: u64 = 60_000;

#[derive(Default)]
struct Index {
    /// node_id -> seq of the latest append for that node (latest-seq-wins).
    by_node_id: HashMap<String, u64>,
    by_agent: HashMap<String, Vec<u64>>,
    by_time_bucket: HashMap<u64, Vec<u64>>,
    tag_index: HashMap<String, Vec<u64>>,
    total_nodes: usize,
}

impl Index {
    fn record(&mut self, node: &MemoryNode, seq: u64) {
        self.by_node_id.insert(node.node_id.clone(), seq);
        self.by_agent.entry(node.agent_id.clone()).or_default().push(seq);
        let bucket = node.timestamp / TIME_BUCKET_MS;
        self.by_time_bucket.entry(bucket).or_default().push(seq);
        for tag in &node.tags {
            self.tag_index.entry(tag.clone()).or_default().push(seq);
        }
        self.total_nodes += 1;
    }

    fn clear(&mut self) {
        self.by_node_id.clear();
        self.by_agent.clear();
        self.by_time_bucket.clear();
        self.tag_index.clear();
        self.total_nodes = 0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped_invalid: usize,
    pub latency_ms: u64,
}

pub struct AtlasAdapter {
    store: Arc<LogStore>,
    max_payload_bytes: usize,
    index: RwLock<Index>,
}

impl AtlasAdapter {
    pub fn new(store: Arc<LogStore>, max_payload_bytes: usize) -> Self {
        Self {
            store,
            max_payload_bytes,
            index: RwLock::new(Index::default()),
        }
    }

    /// Validates `node`, enforces the payload ceiling explicitly (ahead of
    /// the log store's own check, so the caller gets a precise error
    /// before any serialization work on the hot append path), appends it,
    /// then updates the index. Latest-seq wins for `by_node_id`.
    pub fn store_node(&self, node: MemoryNode) -> Result<u64, HyperforgeError> {
        node.validate().map_err(|reason| HyperforgeError::InvalidConfig {
            field: "memory_node".to_string(),
            reason,
        })?;
        let value = serde_json::to_value(&node).map_err(|e| HyperforgeError::DeserializationFailed(e.to_string()))?;
        let serialised_len = canonical_json_bytes(&value).len();
        if serialised_len > self.max_payload_bytes {
            return Err(HyperforgeError::PayloadTooLarge {
                actual: serialised_len,
                limit: self.max_payload_bytes,
            });
        }
        let appended = self.store.append(value)?;
        self.index.write().unwrap().record(&node, appended.seq);
        Ok(appended.seq)
    }

    fn node_at(&self, seq: u64) -> Option<MemoryNode> {
        let entry = self.store.get(seq).ok()?;
        serde_json::from_value::<MemoryNode>(entry.data).ok()
    }

    pub fn get_by_id(&self, node_id: &str) -> Option<MemoryNode> {
        let seq = *self.index.read().unwrap().by_node_id.get(node_id)?;
        self.node_at(seq)
    }

    pub fn query_by_agent(&self, agent: &str, since: Option<u64>, limit: usize) -> Vec<MemoryNode> {
        let seqs = self
            .index
            .read()
            .unwrap()
            .by_agent
            .get(agent)
            .cloned()
            .unwrap_or_default();
        let mut nodes: Vec<MemoryNode> = seqs
            .iter()
            .rev()
            .filter_map(|&seq| self.node_at(seq))
            .filter(|n| since.map_or(true, |s| n.timestamp >= s))
            .take(limit)
            .collect();
        nodes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        nodes
    }

    pub fn query_by_time_range(
        &self,
        from: u64,
        to: u64,
        agent: Option<&str>,
        tags: Option<&[String]>,
        limit: usize,
    ) -> Vec<MemoryNode> {
        let from_bucket = from / TIME_BUCKET_MS;
        let to_bucket = to / TIME_BUCKET_MS;
        let guard = self.index.read().unwrap();
        let mut seqs: Vec<u64> = guard
            .by_time_bucket
            .iter()
            .filter(|(bucket, _)| **bucket >= from_bucket && **bucket <= to_bucket)
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        drop(guard);
        seqs.sort_unstable();
        seqs.dedup();

        let mut nodes: Vec<MemoryNode> = seqs
            .into_iter()
            .filter_map(|seq| self.node_at(seq))
            .filter(|n| n.timestamp >= from && n.timestamp <= to)
            .filter(|n| agent.map_or(true, |a| n.agent_id == a))
            .filter(|n| {
                tags.map_or(true, |required| required.iter().all(|t| n.tags.contains(t)))
            })
            .collect();
        nodes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        nodes.truncate(limit);
        nodes
    }

    /// Scans the log from scratch, validating each entry against the
    /// memory-node schema; invalid ones are counted and skipped.
    pub fn rebuild_index(&self) -> RebuildReport {
        let started = Instant::now();
        let mut report = RebuildReport::default();
        let mut fresh = Index::default();
        for entry in self.store.iter_from(0) {
            report.scanned += 1;
            match serde_json::from_value::<MemoryNode>(entry.data.clone()) {
                Ok(node) if node.validate().is_ok() => {
                    fresh.record(&node, entry.seq);
                    report.indexed += 1;
                }
                _ => {
                    report.skipped_invalid += 1;
                }
            }
        }
        let mut guard = self.index.write().unwrap();
        guard.clear();
        *guard = fresh;
        report.latency_ms = started.elapsed().as_millis() as u64;
        report
    }

    pub fn total_nodes(&self) -> usize {
        self.index.read().unwrap().total_nodes
    }
}

pub fn payload_too_large(err: &HyperforgeError) -> bool {
    err.code() == ErrorCode::PayloadTooLarge
}
