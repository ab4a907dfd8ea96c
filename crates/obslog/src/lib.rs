//! Observability Logger (spec §4.8): a bounded ring buffer of structured
//! events, aggregate metrics derived from them, and a sliding-window
//! health check. This is a separate, in-process typed event bus — not
//! the `tracing` logging every crate also emits through.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use hyperforge_common::{now_ms, EventBus, EventBusExt, Unsubscribe};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EVENTS: usize = 1000;
pub const DEFAULT_ERROR_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_ERROR_THRESHOLD: usize = 10;

pub const EVENT_APPEND: &str = "append";
pub const EVENT_REPLICATION: &str = "replication";
pub const EVENT_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityEvent {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes: Option<u64>,
    pub timestamp: u64,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ObservabilityEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            log_name: None,
            bytes: None,
            timestamp: now_ms(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_log(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = Some(log_name.into());
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.kind.is_empty() {
            return Err("event kind must be non-empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerLogMetrics {
    pub appends: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub total_appends: u64,
    pub total_bytes: u64,
    pub total_replication_events: u64,
    pub total_errors: u64,
    pub avg_bytes_per_append: f64,
    pub error_rate: f64,
    pub per_log: HashMap<String, PerLogMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub error_count_in_window: usize,
    pub window_ms: u64,
    pub threshold: usize,
    pub checked_at: u64,
}

#[derive(Default)]
struct State {
    events: VecDeque<ObservabilityEvent>,
    metrics: Metrics,
    error_timestamps: VecDeque<u64>,
    total_events: u64,
}

pub struct ObservabilityLogger {
    max_events: usize,
    error_window_ms: u64,
    error_threshold: usize,
    state: RwLock<State>,
    listeners: Arc<EventBus<ObservabilityEvent>>,
}

impl ObservabilityLogger {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_EVENTS, DEFAULT_ERROR_WINDOW_MS, DEFAULT_ERROR_THRESHOLD)
    }

    pub fn with_limits(max_events: usize, error_window_ms: u64, error_threshold: usize) -> Self {
        Self {
            max_events,
            error_window_ms,
            error_threshold,
            state: RwLock::new(State::default()),
            listeners: EventBus::new(),
        }
    }

    pub fn on(&self, handler: impl Fn(&ObservabilityEvent) + Send + Sync + 'static) -> Unsubscribe<ObservabilityEvent> {
        self.listeners.subscribe(handler)
    }

    /// Validates `event`, appends it to the ring buffer (evicting the
    /// oldest entry once `max_events` is exceeded), folds it into the
    /// aggregate metrics, and — for `error` events — records a
    /// window timestamp for the health check. Rejected events are
    /// neither buffered nor counted.
    pub fn record(&self, event: ObservabilityEvent) -> Result<(), String> {
        event.validate()?;
        let mut guard = self.state.write().unwrap();

        guard.events.push_back(event.clone());
        if guard.events.len() > self.max_events {
            guard.events.pop_front();
        }
        guard.total_events += 1;

        match event.kind.as_str() {
            EVENT_APPEND => {
                guard.metrics.total_appends += 1;
                let bytes = event.bytes.unwrap_or(0);
                guard.metrics.total_bytes += bytes;
                if let Some(log_name) = &event.log_name {
                    let entry = guard.metrics.per_log.entry(log_name.clone()).or_default();
                    entry.appends += 1;
                    entry.bytes += bytes;
                }
            }
            EVENT_REPLICATION => {
                guard.metrics.total_replication_events += 1;
            }
            EVENT_ERROR => {
                guard.metrics.total_errors += 1;
                guard.error_timestamps.push_back(event.timestamp);
            }
            _ => {}
        }

        guard.metrics.avg_bytes_per_append = if guard.metrics.total_appends > 0 {
            guard.metrics.total_bytes as f64 / guard.metrics.total_appends as f64
        } else {
            0.0
        };
        guard.metrics.error_rate = if guard.total_events > 0 {
            guard.metrics.total_errors as f64 / guard.total_events as f64
        } else {
            0.0
        };
        drop(guard);

        self.listeners.emit(&event);
        Ok(())
    }

    pub fn get_metrics(&self) -> Metrics {
        self.state.read().unwrap().metrics.clone()
    }

    /// Evicts timestamps older than `error_window_ms` relative to `now`,
    /// then reports whether the remaining count is under the threshold.
    pub fn get_health(&self) -> Health {
        let now = now_ms();
        let mut guard = self.state.write().unwrap();
        let cutoff = now.saturating_sub(self.error_window_ms);
        while matches!(guard.error_timestamps.front(), Some(&t) if t < cutoff) {
            guard.error_timestamps.pop_front();
        }
        let count = guard.error_timestamps.len();
        Health {
            healthy: count < self.error_threshold,
            error_count_in_window: count,
            window_ms: self.error_window_ms,
            threshold: self.error_threshold,
            checked_at: now,
        }
    }

    pub fn get_recent_events(&self, limit: usize) -> Vec<ObservabilityEvent> {
        let guard = self.state.read().unwrap();
        let len = guard.events.len();
        let start = len.saturating_sub(limit);
        guard.events.iter().skip(start).cloned().collect()
    }

    pub fn reset(&self) {
        let mut guard = self.state.write().unwrap();
        *guard = State::default();
    }
}

impl Default for ObservabilityLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn record_rejects_empty_kind() {
        let logger = ObservabilityLogger::new();
        let mut event = ObservabilityEvent::new("append");
        event.kind.clear();
        assert!(logger.record(event).is_err());
        assert_eq!(logger.get_metrics().total_appends, 0);
    }

    #[test]
    fn metrics_aggregate_appends_and_per_log_breakdown() {
        let logger = ObservabilityLogger::new();
        logger
            .record(ObservabilityEvent::new(EVENT_APPEND).with_log("log-a").with_bytes(100))
            .unwrap();
        logger
            .record(ObservabilityEvent::new(EVENT_APPEND).with_log("log-a").with_bytes(50))
            .unwrap();
        logger
            .record(ObservabilityEvent::new(EVENT_APPEND).with_log("log-b").with_bytes(10))
            .unwrap();

        let metrics = logger.get_metrics();
        assert_eq!(metrics.total_appends, 3);
        assert_eq!(metrics.total_bytes, 160);
        assert!((metrics.avg_bytes_per_append - 160.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.per_log.get("log-a").unwrap().appends, 2);
        assert_eq!(metrics.per_log.get("log-b").unwrap().bytes, 10);
    }

    #[test]
    fn ring_buffer_evicts_oldest_beyond_max_events() {
        let logger = ObservabilityLogger::with_limits(3, DEFAULT_ERROR_WINDOW_MS, DEFAULT_ERROR_THRESHOLD);
        for i in 0..5 {
            logger
                .record(ObservabilityEvent::new(EVENT_APPEND).with_bytes(i))
                .unwrap();
        }
        let recent = logger.get_recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].bytes, Some(2));
        assert_eq!(recent[2].bytes, Some(4));
    }

    #[test]
    fn health_is_unhealthy_once_error_threshold_is_reached() {
        let logger = ObservabilityLogger::with_limits(DEFAULT_MAX_EVENTS, DEFAULT_ERROR_WINDOW_MS, 3);
        for _ in 0..3 {
            logger.record(ObservabilityEvent::new(EVENT_ERROR)).unwrap();
        }
        let health = logger.get_health();
        assert!(!health.healthy);
        assert_eq!(health.error_count_in_window, 3);
    }

    #[test]
    fn health_ignores_errors_outside_the_window() {
        let logger = ObservabilityLogger::with_limits(DEFAULT_MAX_EVENTS, 1, 1);
        let mut stale = ObservabilityEvent::new(EVENT_ERROR);
        stale.timestamp = 0;
        logger.record(stale).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let health = logger.get_health();
        assert!(health.healthy, "the lone error timestamp is far outside a 1ms window");
    }

    #[test]
    fn listeners_are_notified_on_record() {
        let logger = ObservabilityLogger::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        logger.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        logger.record(ObservabilityEvent::new(EVENT_APPEND)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_events_and_metrics() {
        let logger = ObservabilityLogger::new();
        logger.record(ObservabilityEvent::new(EVENT_APPEND).with_bytes(5)).unwrap();
        logger.reset();
        assert_eq!(logger.get_metrics().total_appends, 0);
        assert!(logger.get_recent_events(10).is_empty());
    }
}
