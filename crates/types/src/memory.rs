//! Tagged-union log payload variants: the ATLAS memory node (spec §3
//! "Memory Node") and the CRDT update (spec §3 "CRDT Update"). Both ride
//! the same append-only log as `data` with a `type` discriminant, so
//! readers filter by discriminant instead of ad-hoc type checks (spec §9
//! "Multiple variants on one log").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const MEMORY_NODE_TYPE: &str = "memory-node";
pub const CRDT_UPDATE_TYPE: &str = "crdt-update";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: String,
    pub agent_id: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub taste_score: f64,
    pub timestamp: u64,
    #[serde(default)]
    pub vector_clock: HashMap<String, u64>,
}

impl MemoryNode {
    pub fn new(
        node_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: serde_json::Value,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: MEMORY_NODE_TYPE.to_string(),
            node_id: node_id.into(),
            agent_id: agent_id.into(),
            content,
            tags: Vec::new(),
            taste_score: 0.0,
            timestamp,
            vector_clock: HashMap::new(),
        }
    }

    /// Field-level validation: the discriminant, score bound, and required
    /// identifiers must all hold for an entry to be indexable.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind != MEMORY_NODE_TYPE {
            return Err(format!("expected type `{MEMORY_NODE_TYPE}`, got `{}`", self.kind));
        }
        if self.node_id.is_empty() {
            return Err("node_id must be non-empty".into());
        }
        if self.agent_id.is_empty() {
            return Err("agent_id must be non-empty".into());
        }
        if !(0.0..=1.0).contains(&self.taste_score) {
            return Err(format!(
                "taste_score {} out of range [0, 1]",
                self.taste_score
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtOperationKind {
    Insert,
    Delete,
    Update,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrdtUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub operation_id: String,
    pub peer_id: String,
    pub target_node_id: String,
    pub operation: CrdtOperationKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub vector_clock: HashMap<String, u64>,
    pub timestamp: u64,
}

impl CrdtUpdate {
    pub fn validate(&self) -> Result<(), String> {
        if self.kind != CRDT_UPDATE_TYPE {
            return Err(format!("expected type `{CRDT_UPDATE_TYPE}`, got `{}`", self.kind));
        }
        if self.operation_id.is_empty() {
            return Err("operation_id must be non-empty".into());
        }
        if self.peer_id.is_empty() {
            return Err("peer_id must be non-empty".into());
        }
        if self.target_node_id.is_empty() {
            return Err("target_node_id must be non-empty".into());
        }
        Ok(())
    }
}
