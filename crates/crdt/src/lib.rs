//! CRDT Bridge (spec §4.7): pub/sub atop the append-only log.
//!
//! `broadcast` validates and appends a `CrdtUpdate`, then synchronously
//! notifies every registered handler (reusing the same `EventBus` the
//! Discovery Manager and Observability Logger use, so handler panics
//! never take out sibling handlers). `poll` is the pull-side counterpart:
//! it scans the store from the last-observed sequence, skipping anything
//! that doesn't parse as a valid `CrdtUpdate`, and advances its cursor
//! past every entry it looked at — malformed entries are not retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hyperforge_common::{EventBus, EventBusExt, Unsubscribe};
use hyperforge_hypercore::LogStore;
use hyperforge_types::memory::CrdtUpdate;
use hyperforge_types::HyperforgeError;

#[derive(Debug, Clone)]
pub struct CrdtEvent {
    pub seq: u64,
    pub update: CrdtUpdate,
}

pub struct CrdtBridge {
    store: Arc<LogStore>,
    cursor: AtomicU64,
    events: Arc<EventBus<CrdtEvent>>,
}

impl CrdtBridge {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self {
            store,
            cursor: AtomicU64::new(0),
            events: EventBus::new(),
        }
    }

    pub fn on_update(&self, handler: impl Fn(&CrdtEvent) + Send + Sync + 'static) -> Unsubscribe<CrdtEvent> {
        self.events.subscribe(handler)
    }

    /// Validates and appends `update`; on success, notifies every
    /// registered handler before returning the assigned sequence number.
    pub fn broadcast(&self, update: CrdtUpdate) -> Result<u64, HyperforgeError> {
        update.validate().map_err(|reason| HyperforgeError::InvalidConfig {
            field: "crdt_update".to_string(),
            reason,
        })?;
        let value = serde_json::to_value(&update).map_err(|e| HyperforgeError::DeserializationFailed(e.to_string()))?;
        let appended = self.store.append(value)?;
        self.events.emit(&CrdtEvent {
            seq: appended.seq,
            update,
        });
        Ok(appended.seq)
    }

    /// Scans forward from the last-observed sequence, emitting every
    /// valid `CrdtUpdate` to subscribers and returning the ones it
    /// emitted. Malformed entries are skipped, not retried: the cursor
    /// always advances to the store's current length.
    pub fn poll(&self) -> Vec<CrdtEvent> {
        let from = self.cursor.load(Ordering::SeqCst);
        let mut emitted = Vec::new();
        let mut advanced = from;
        for entry in self.store.iter_from(from) {
            advanced = entry.seq + 1;
            match serde_json::from_value::<CrdtUpdate>(entry.data.clone()) {
                Ok(update) if update.validate().is_ok() => {
                    let event = CrdtEvent {
                        seq: entry.seq,
                        update,
                    };
                    self.events.emit(&event);
                    emitted.push(event);
                }
                _ => {
                    tracing::debug!(seq = entry.seq, "skipping malformed crdt-update entry during poll");
                }
            }
        }
        self.cursor.store(advanced, Ordering::SeqCst);
        emitted
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }
}

/// A compressed, point-in-time snapshot of CRDT state for one session.
/// Two nodes may independently compress the same session's update log;
/// reconciling them is a last-writer-wins pick on `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedContext {
    pub session_id: String,
    pub created_at: u64,
    pub state: serde_json::Value,
}

/// Reconciles two divergent compressed contexts for the same session,
/// keeping whichever was created later. Ties keep `a`.
pub fn reconcile(a: CompressedContext, b: CompressedContext) -> CompressedContext {
    debug_assert_eq!(a.session_id, b.session_id, "reconcile requires the same session");
    if b.created_at > a.created_at {
        b
    } else {
        a
    }
}
