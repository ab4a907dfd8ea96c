//! A small generic, strongly-typed event bus with explicit unsubscribe
//! capabilities (spec §9 "Dynamic event emitters").
//!
//! Used by the Discovery Manager, the Observability Logger, and the CRDT
//! Bridge — each defines its own event enum and wraps an `EventBus<E>`
//! rather than reaching for a stringly-typed emitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: u64,
    handler: Handler<E>,
}

pub struct EventBus<E> {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

/// An explicit capability to remove a previously-registered handler.
/// Dropping it does *not* unsubscribe; callers must call `.unsubscribe()`.
pub struct Unsubscribe<E> {
    id: u64,
    bus: Arc<EventBus<E>>,
}

impl<E> Unsubscribe<E> {
    pub fn unsubscribe(self) {
        self.bus
            .subscribers
            .write()
            .unwrap()
            .retain(|s| s.id != self.id);
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub trait EventBusExt<E> {
    fn subscribe(self: &Arc<Self>, handler: impl Fn(&E) + Send + Sync + 'static) -> Unsubscribe<E>;
    fn emit(&self, event: &E);
}

impl<E> EventBusExt<E> for EventBus<E> {
    fn subscribe(self: &Arc<Self>, handler: impl Fn(&E) + Send + Sync + 'static) -> Unsubscribe<E> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().unwrap().push(Subscriber {
            id,
            handler: Box::new(handler),
        });
        Unsubscribe {
            id,
            bus: self.clone(),
        }
    }

    /// Notifies every registered handler synchronously, in registration
    /// order. A handler that panics is caught so sibling handlers still
    /// run (spec §4.7 "handler errors must not affect sibling handlers").
    fn emit(&self, event: &E) {
        let guard = self.subscribers.read().unwrap();
        for sub in guard.iter() {
            let handler = &sub.handler;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                tracing::warn!("event bus handler panicked; continuing with remaining handlers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_events_until_unsubscribed() {
        let bus: Arc<EventBus<i32>> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&1);
        bus.emit(&2);
        sub.unsubscribe();
        bus.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_handler_does_not_block_siblings() {
        let bus: Arc<EventBus<i32>> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(|_| panic!("boom"));
        bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
