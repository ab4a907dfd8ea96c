//! A named map of logs, lazily constructing a log on first `get(name)`
//! (spec §4.1 "A *Corestore* collaborator").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hyperforge_common::new_id;

use crate::log_store::LogStore;

pub struct Corestore {
    max_payload_bytes: usize,
    logs: RwLock<HashMap<String, Arc<LogStore>>>,
}

impl Default for Corestore {
    fn default() -> Self {
        Self::new(hyperforge_types::log::DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl Corestore {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            max_payload_bytes,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the log named `name`, creating it (with a freshly generated
    /// public key) if it doesn't exist yet.
    pub fn get(&self, name: &str) -> Arc<LogStore> {
        if let Some(existing) = self.logs.read().unwrap().get(name) {
            return existing.clone();
        }
        let mut guard = self.logs.write().unwrap();
        guard
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(LogStore::with_max_payload_bytes(
                    name,
                    new_id(),
                    self.max_payload_bytes,
                ))
            })
            .clone()
    }

    /// Returns `None` without constructing anything, unlike [`Corestore::get`].
    pub fn peek(&self, name: &str) -> Option<Arc<LogStore>> {
        self.logs.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.logs.read().unwrap().keys().cloned().collect()
    }
}
