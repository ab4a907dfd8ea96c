//! Audit event schema (spec §3 "Audit Event", §6 "Event schema") and its
//! on-disk persistence to `hypervisor/audit.jsonl`, one event per line.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    Spawn,
    Terminate,
    PolicyViolation,
    ResourceChange,
    StateChange,
    ChecksumFailure,
    PluginVerification,
    Append,
    Replicate,
    Error,
    HealthWarning,
    Ready,
    CrdtUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: u64,
    /// Either a `vm_id` or a `log_name`, depending on `event_type`.
    pub subject: String,
    pub event_type: AuditEventType,
    pub actor: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(
        timestamp: u64,
        subject: impl Into<String>,
        event_type: AuditEventType,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            subject: subject.into(),
            event_type,
            actor: actor.into(),
            details: HashMap::new(),
            duration_ms: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// True when the event satisfies L11's completeness constraints:
    /// positive timestamp and a non-empty actor.
    pub fn is_well_formed(&self) -> bool {
        self.timestamp > 0 && !self.actor.is_empty() && !self.subject.is_empty()
    }
}

/// Appends one JSON line per [`AuditEvent`] to a persisted log (spec §6's
/// `hypervisor/audit.jsonl`). Writes are serialized behind a mutex so
/// concurrent callers never interleave partial lines.
pub struct AuditLogWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Appends `event`, creating the parent directory and file on first
    /// use. A malformed event (per [`AuditEvent::is_well_formed`]) is
    /// still written — completeness is enforced by callers constructing
    /// well-formed events, not by silently dropping bad ones here.
    pub fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(event).expect("AuditEvent always serializes");
        writeln!(file, "{line}")
    }

    /// Reads back every event previously appended, in append order. An
    /// absent file (nothing logged yet) reads as an empty log.
    pub fn read_all(&self) -> std::io::Result<Vec<AuditEvent>> {
        let _guard = self.lock.lock().unwrap();
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_all_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditLogWriter::new(dir.path().join("hypervisor/audit.jsonl"));

        writer
            .append(&AuditEvent::new(1, "vm-1", AuditEventType::Spawn, "operator"))
            .unwrap();
        writer
            .append(&AuditEvent::new(2, "vm-1", AuditEventType::Terminate, "operator"))
            .unwrap();

        let events = writer.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::Spawn);
        assert_eq!(events[1].event_type, AuditEventType::Terminate);
    }

    #[test]
    fn read_all_on_missing_file_is_an_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditLogWriter::new(dir.path().join("hypervisor/audit.jsonl"));
        assert!(writer.read_all().unwrap().is_empty());
    }

    #[test]
    fn l11_every_spawn_and_terminate_produces_a_well_formed_audit_entry() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditLogWriter::new(dir.path().join("hypervisor/audit.jsonl"));

        for i in 0..5u64 {
            writer
                .append(&AuditEvent::new(i + 1, format!("vm-{i}"), AuditEventType::Spawn, "hypervisor-manager"))
                .unwrap();
            writer
                .append(&AuditEvent::new(i + 1, format!("vm-{i}"), AuditEventType::Terminate, "hypervisor-manager"))
                .unwrap();
        }

        let events = writer.read_all().unwrap();
        assert_eq!(events.len(), 10);
        assert!(events.iter().all(AuditEvent::is_well_formed));
    }
}
