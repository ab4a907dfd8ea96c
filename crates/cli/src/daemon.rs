//! Wires a `HostConfig` into a running set of components and drives
//! them from a line-oriented stdin loop. No network server is part of
//! this spec, so this is the daemon's entire external interface.

use std::io::{BufRead, Write};
use std::sync::Arc;

use hyperforge_config::HostConfig;
use hyperforge_hypercore::Corestore;
use hyperforge_hypervisor::HypervisorManager;
use hyperforge_obslog::{ObservabilityEvent, ObservabilityLogger};
use hyperforge_replication::ReplicationManager;
use hyperforge_sandbox::{DeployOverrides, MoltbotRegistry, SandboxAdapter};
use hyperforge_types::audit::{AuditEvent, AuditEventType, AuditLogWriter};
use hyperforge_types::vm::{Provider, TrustedManifest};

pub struct Daemon {
    pub config: HostConfig,
    pub logger: Arc<ObservabilityLogger>,
    pub audit: Arc<AuditLogWriter>,
    pub corestore: Arc<Corestore>,
    pub replication: Arc<ReplicationManager>,
    pub hvm: Arc<HypervisorManager>,
    pub sandbox: Arc<SandboxAdapter>,
    pub registry: Arc<MoltbotRegistry>,
    manifest: TrustedManifest,
}

impl Daemon {
    /// Constructs every component named in SPEC_FULL.md §2's daemon
    /// wiring list and subscribes the observability logger to the
    /// hypervisor manager's event bus.
    pub fn wire(config: HostConfig) -> anyhow::Result<Self> {
        let layout = config.layout();
        std::fs::create_dir_all(layout.root.join("hypervisor"))?;

        let logger = Arc::new(ObservabilityLogger::with_limits(
            config.runtime.max_events,
            config.runtime.error_window_secs * 1000,
            config.runtime.error_threshold as usize,
        ));
        let audit = Arc::new(AuditLogWriter::new(layout.audit_log()));
        let corestore = Arc::new(Corestore::new(config.runtime.max_payload_bytes));
        let replication = Arc::new(ReplicationManager::new(corestore.clone()));

        let manifest = load_manifest(&layout.manifest()).unwrap_or_default();
        let hvm = Arc::new(HypervisorManager::new(
            config.host_capacity.into(),
            config.runtime.max_concurrent_vms,
            config.runtime.boot_timeout_ms,
            config.runtime.grace_period_ms,
            config.runtime.health_warning_window_ms,
            config.runtime.health_warning_threshold,
            manifest.clone(),
        ));

        let logger_for_hvm = logger.clone();
        let audit_for_hvm = audit.clone();
        hvm.on(move |event| {
            let obs_event = hvm_event_to_observability(event);
            if let Err(reason) = logger_for_hvm.record(obs_event) {
                tracing::warn!(%reason, "dropped malformed hvm event");
            }
            if let Some(audit_event) = hvm_event_to_audit(event) {
                if let Err(err) = audit_for_hvm.append(&audit_event) {
                    tracing::warn!(%err, "failed to append audit event");
                }
            }
        });

        hvm.initialize(&[Provider::Firecracker, Provider::CloudHypervisor, Provider::Unikernel])?;

        let sandbox = Arc::new(SandboxAdapter::new(hvm.clone()));
        let registry = Arc::new(MoltbotRegistry::new(sandbox.clone(), layout.registry()));
        registry.load()?;

        Ok(Self {
            config,
            logger,
            audit,
            corestore,
            replication,
            hvm,
            sandbox,
            registry,
            manifest,
        })
    }

    /// Reads commands from `input` one line at a time until `quit`,
    /// `exit`, or EOF, writing responses to `output`.
    pub fn run_repl(&self, input: impl BufRead, mut output: impl Write) -> anyhow::Result<()> {
        writeln!(output, "hyperforge daemon ready; type `help` for commands")?;
        for line in input.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "quit" || line == "exit" {
                break;
            }
            match self.dispatch(line) {
                Ok(response) => writeln!(output, "{response}")?,
                Err(e) => writeln!(output, "error: {e}")?,
            }
        }
        Ok(())
    }

    fn dispatch(&self, line: &str) -> anyhow::Result<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["help"] => Ok(HELP_TEXT.to_string()),
            ["status"] => {
                let metrics = self.hvm.get_metrics();
                let health = self.logger.get_health();
                Ok(format!(
                    "vms: {}/{} running, vcpus_in_use={}, memory_mb_in_use={}; healthy={} errors_in_window={}",
                    metrics.running_vms,
                    metrics.total_vms,
                    metrics.vcpus_in_use,
                    metrics.memory_mb_in_use,
                    health.healthy,
                    health.error_count_in_window
                ))
            }
            ["vm", "list"] => {
                let vms = self.hvm.list_vms();
                Ok(vms
                    .iter()
                    .map(|v| format!("{} [{:?}] {}", v.id, v.state, v.spec.name))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            ["vm", "spawn", hac_path] => {
                let spec = parse_hac_file(hac_path)?;
                match self.hvm.spawn(spec) {
                    Ok(vm_id) => Ok(vm_id),
                    Err(err) => {
                        if err.code() == hyperforge_types::ErrorCode::ChecksumMismatch {
                            self.record_audit(AuditEventType::ChecksumFailure, hac_path, "hypervisor-manager", &err.to_string());
                        }
                        Err(err.into())
                    }
                }
            }
            ["vm", "terminate", vm_id] => {
                self.hvm.terminate(vm_id, "operator request")?;
                Ok(format!("terminated {vm_id}"))
            }
            ["vm", "status", vm_id] => {
                let instance = self.hvm.get_status(vm_id)?;
                Ok(format!("{:?}", instance.state))
            }
            ["agent", "deploy", name, hac_path] => {
                let spec = parse_hac_file(hac_path)?;
                let vm_id = self.registry.deploy(name, spec, DeployOverrides::default())?;
                Ok(vm_id)
            }
            ["agent", "undeploy", name] => {
                let result = self.registry.undeploy(name)?;
                Ok(format!("host_state_clean={}", result.host_state_clean))
            }
            ["agent", "list"] => Ok(self
                .registry
                .list()
                .iter()
                .map(|d| format!("{} -> {} [{:?}]", d.agent_name, d.vm_id, d.state))
                .collect::<Vec<_>>()
                .join("\n")),
            ["plugin", "verify", name, signature] => {
                match hyperforge_sandbox::verify_plugin_signature(name, signature, &self.manifest.plugins) {
                    Ok(()) => {
                        self.record_audit(AuditEventType::PluginVerification, name, "moltbot-registry", "verified");
                        Ok(format!("{name}: verified"))
                    }
                    Err(err) => {
                        self.record_audit(AuditEventType::PluginVerification, name, "moltbot-registry", &err.to_string());
                        Err(err.into())
                    }
                }
            }
            _ => Ok(format!("unrecognized command `{line}`; type `help`")),
        }
    }

    /// Appends an [`AuditEvent`] outside the hypervisor event bus, for
    /// operations (checksum gate, plugin verification) that only ever
    /// surface as a direct command result rather than a lifecycle event.
    fn record_audit(&self, event_type: AuditEventType, subject: &str, actor: &str, detail: &str) {
        let event = AuditEvent::new(hyperforge_common::now_ms(), subject, event_type, actor).with_detail("detail", detail);
        if let Err(err) = self.audit.append(&event) {
            tracing::warn!(%err, "failed to append audit event");
        }
    }
}

const HELP_TEXT: &str = "\
commands:
  status
  vm list
  vm spawn <hac-file>
  vm terminate <vm-id>
  vm status <vm-id>
  agent deploy <name> <hac-file>
  agent undeploy <name>
  agent list
  plugin verify <name> <signature>
  quit";

fn parse_hac_file(path: &str) -> anyhow::Result<hyperforge_types::vm::VmSpec> {
    let text = std::fs::read_to_string(path)?;
    hyperforge_hac::parse(&text).map_err(|e| anyhow::anyhow!(e))
}

fn load_manifest(path: &std::path::Path) -> Option<TrustedManifest> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn hvm_event_to_observability(event: &hyperforge_hypervisor::HvmEvent) -> ObservabilityEvent {
    use hyperforge_hypervisor::HvmEvent::*;
    match event {
        Ready(statuses) => ObservabilityEvent::new("ready").with_details(serde_json::json!({ "providers": statuses.len() })),
        StateChange { vm_id, from, to, reason } => ObservabilityEvent::new("state-change")
            .with_log(vm_id.clone())
            .with_details(serde_json::json!({ "from": format!("{from:?}"), "to": format!("{to:?}"), "reason": reason })),
        VmSpawned { vm_id } => ObservabilityEvent::new("spawn").with_log(vm_id.clone()),
        VmTerminated { vm_id, reason } => {
            ObservabilityEvent::new("terminate").with_log(vm_id.clone()).with_details(serde_json::json!({ "reason": reason }))
        }
        SecurityViolation { vm_id, description } => ObservabilityEvent::new(hyperforge_obslog::EVENT_ERROR)
            .with_log(vm_id.clone())
            .with_details(serde_json::json!({ "kind": "security-violation", "description": description })),
        HealthWarning { vm_id, error_count } => ObservabilityEvent::new("health-warning")
            .with_log(vm_id.clone())
            .with_details(serde_json::json!({ "error_count": error_count })),
    }
}

/// Translates a lifecycle event into its persisted audit entry. `Ready`
/// carries no single subject and isn't otherwise a per-VM lifecycle
/// transition, so it's left to the in-process observability logger.
fn hvm_event_to_audit(event: &hyperforge_hypervisor::HvmEvent) -> Option<AuditEvent> {
    use hyperforge_hypervisor::HvmEvent::*;
    let now = hyperforge_common::now_ms();
    Some(match event {
        Ready(_) => return None,
        StateChange { vm_id, from, to, reason } => {
            AuditEvent::new(now, vm_id.clone(), AuditEventType::StateChange, "hypervisor-manager")
                .with_detail("from", format!("{from:?}"))
                .with_detail("to", format!("{to:?}"))
                .with_detail("reason", reason)
        }
        VmSpawned { vm_id } => AuditEvent::new(now, vm_id.clone(), AuditEventType::Spawn, "hypervisor-manager"),
        VmTerminated { vm_id, reason } => {
            AuditEvent::new(now, vm_id.clone(), AuditEventType::Terminate, "hypervisor-manager").with_detail("reason", reason)
        }
        SecurityViolation { vm_id, description } => {
            AuditEvent::new(now, vm_id.clone(), AuditEventType::PolicyViolation, "hypervisor-manager").with_detail("description", description)
        }
        HealthWarning { vm_id, error_count } => {
            AuditEvent::new(now, vm_id.clone(), AuditEventType::HealthWarning, "hypervisor-manager").with_detail("error_count", error_count)
        }
    })
}
