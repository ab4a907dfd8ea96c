//! Hypervisor Manager (spec §4.9): the VM lifecycle state machine, its
//! capacity/checksum/boot gates, and the VSOCK-routed task execution
//! path. The Image Verifier (spec §4.11) lives here too, since `spawn`'s
//! checksum gate is a Hypervisor Manager responsibility that the
//! Ultra-Sandbox Adapter (`hyperforge_sandbox`, built on top of this
//! crate) reuses rather than duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hyperforge_common::{now_ms, sha256_hex, new_id, EventBus, EventBusExt, Unsubscribe};
use hyperforge_types::vm::{HostCapacity, Provider, TrustedManifest, VmInstance, VmMetrics, VmSpec, VmState};
use hyperforge_types::{HyperforgeError, Result};
use hyperforge_vsock::{ResultEnvelope, TaskEnvelope, VsockChannel};

pub const SIMULATE_BOOT_TIMEOUT: &str = "__simulate_boot_timeout";
pub const SIMULATE_VSOCK_FAILURE: &str = "__simulate_vsock_failure";

#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub provider: Provider,
    pub version: String,
    pub available: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HvmEvent {
    Ready(Vec<ProviderStatus>),
    StateChange {
        vm_id: String,
        from: VmState,
        to: VmState,
        reason: String,
    },
    VmSpawned {
        vm_id: String,
    },
    VmTerminated {
        vm_id: String,
        reason: String,
    },
    SecurityViolation {
        vm_id: String,
        description: String,
    },
    HealthWarning {
        vm_id: String,
        error_count: u32,
    },
}

/// Stands in for hashing the actual kernel/rootfs image bytes: since this
/// workspace has no real HAL to read images from, the "content" a path
/// refers to is the path string itself. Real deployments would hash the
/// file; the verification logic (compare-against-manifest,
/// fail-closed-on-missing-entry) is the part under test here.
fn content_digest(path: &str) -> String {
    sha256_hex(&[path.as_bytes()])
}

/// Verifies `kernel_path`/`rootfs_path` against `manifest`'s recorded
/// digests. A path absent from the manifest is untrusted and fails
/// closed, same as a mismatched digest.
pub fn verify_image(kernel_path: &str, rootfs_path: &str, manifest: &TrustedManifest) -> Result<()> {
    let kernel_actual = content_digest(kernel_path);
    match manifest.kernels.get(kernel_path) {
        Some(expected) if expected == &kernel_actual => {}
        Some(expected) => {
            return Err(HyperforgeError::ChecksumMismatch {
                path: kernel_path.to_string(),
                expected: expected.clone(),
                actual: kernel_actual,
            })
        }
        None => {
            return Err(HyperforgeError::ChecksumMismatch {
                path: kernel_path.to_string(),
                expected: "<not in trusted manifest>".to_string(),
                actual: kernel_actual,
            })
        }
    }

    let rootfs_actual = content_digest(rootfs_path);
    match manifest.images.get(rootfs_path) {
        Some(expected) if expected == &rootfs_actual => Ok(()),
        Some(expected) => Err(HyperforgeError::ChecksumMismatch {
            path: rootfs_path.to_string(),
            expected: expected.clone(),
            actual: rootfs_actual,
        }),
        None => Err(HyperforgeError::ChecksumMismatch {
            path: rootfs_path.to_string(),
            expected: "<not in trusted manifest>".to_string(),
            actual: rootfs_actual,
        }),
    }
}

/// Computes the digest a [`TrustedManifest`] should carry for `path` so
/// that [`verify_image`] accepts it. Used to build test fixtures and by
/// tooling that provisions a manifest from a set of known-good images.
pub fn trusted_digest_for(path: &str) -> String {
    content_digest(path)
}

#[derive(Debug, Clone, Default)]
pub struct HypervisorMetrics {
    pub total_vms: usize,
    pub running_vms: usize,
    pub vcpus_in_use: u32,
    pub memory_mb_in_use: u32,
}

struct VmRecord {
    instance: VmInstance,
    channel: Arc<VsockChannel>,
    guest_channel: Arc<VsockChannel>,
}

struct Inner {
    manifest: TrustedManifest,
    instances: HashMap<String, VmRecord>,
    error_windows: HashMap<String, VecDeque<u64>>,
}

pub struct HypervisorManager {
    host_capacity: HostCapacity,
    max_concurrent_vms: usize,
    boot_timeout_ms: u64,
    grace_period_ms: u64,
    health_warning_window_ms: u64,
    health_warning_threshold: u32,
    inner: RwLock<Inner>,
    events: Arc<EventBus<HvmEvent>>,
}

impl HypervisorManager {
    pub fn new(
        host_capacity: HostCapacity,
        max_concurrent_vms: usize,
        boot_timeout_ms: u64,
        grace_period_ms: u64,
        health_warning_window_ms: u64,
        health_warning_threshold: u32,
        manifest: TrustedManifest,
    ) -> Self {
        Self {
            host_capacity,
            max_concurrent_vms,
            boot_timeout_ms,
            grace_period_ms,
            health_warning_window_ms,
            health_warning_threshold,
            inner: RwLock::new(Inner {
                manifest,
                instances: HashMap::new(),
                error_windows: HashMap::new(),
            }),
            events: EventBus::new(),
        }
    }

    pub fn on(&self, handler: impl Fn(&HvmEvent) + Send + Sync + 'static) -> Unsubscribe<HvmEvent> {
        self.events.subscribe(handler)
    }

    pub fn set_manifest(&self, manifest: TrustedManifest) {
        self.inner.write().unwrap().manifest = manifest;
    }

    /// Probes the given providers (a stand-in for the real HAL/containerd
    /// probe) and emits `ready`. Fails if none are available.
    pub fn initialize(&self, providers: &[Provider]) -> Result<Vec<ProviderStatus>> {
        if providers.is_empty() {
            return Err(HyperforgeError::HalNotFound(
                "no hypervisor providers configured".to_string(),
            ));
        }
        let statuses: Vec<ProviderStatus> = providers
            .iter()
            .map(|p| ProviderStatus {
                provider: *p,
                version: "1.0.0".to_string(),
                available: true,
                reason: None,
            })
            .collect();
        self.events.emit(&HvmEvent::Ready(statuses.clone()));
        Ok(statuses)
    }

    fn active_totals(guard: &Inner) -> (usize, u32, u32) {
        let mut count = 0usize;
        let mut vcpus = 0u32;
        let mut memory = 0u32;
        for record in guard.instances.values() {
            if record.instance.state != VmState::Terminated {
                count += 1;
                vcpus += record.instance.spec.vcpus;
                memory += record.instance.spec.memory_mb;
            }
        }
        (count, vcpus, memory)
    }

    fn emit_state_change(&self, vm_id: &str, from: VmState, to: VmState, reason: &str) {
        self.events.emit(&HvmEvent::StateChange {
            vm_id: vm_id.to_string(),
            from,
            to,
            reason: reason.to_string(),
        });
    }

    /// Validates `next` against [`VmState::can_transition_to`] before
    /// committing it, so an invalid transition is rejected rather than
    /// merely never attempted. Returns the prior state on success.
    fn apply_transition(current: &mut VmState, next: VmState, vm_id: &str) -> Result<VmState> {
        let from = *current;
        if !from.can_transition_to(next) {
            return Err(HyperforgeError::InvalidConfig {
                field: "vm_state".to_string(),
                reason: format!("vm `{vm_id}` cannot transition from {from:?} to {next:?}"),
            });
        }
        *current = next;
        Ok(from)
    }

    /// Implements the full spawn gate sequence from spec §4.9 (a)-(g).
    /// Boot and VSOCK-liveness are simulated synchronously: a spec can
    /// carry `metadata["__simulate_boot_timeout"] = "true"` to exercise
    /// the `BOOT_TIMEOUT` path deterministically without a real HAL.
    pub fn spawn(&self, spec: VmSpec) -> Result<String> {
        spec.validate().map_err(|(field, reason)| HyperforgeError::InvalidConfig { field, reason })?;

        let mut guard = self.inner.write().unwrap();
        let (active_count, active_vcpus, active_memory) = Self::active_totals(&guard);
        if active_count >= self.max_concurrent_vms {
            return Err(HyperforgeError::MaxVmsExceeded {
                max: self.max_concurrent_vms,
            });
        }
        if active_vcpus + spec.vcpus > self.host_capacity.vcpus
            || active_memory + spec.memory_mb > self.host_capacity.memory_mb
        {
            return Err(HyperforgeError::ResourceExceeded(format!(
                "requested vcpus={} memory_mb={} would exceed host capacity vcpus={} memory_mb={}",
                spec.vcpus, spec.memory_mb, self.host_capacity.vcpus, self.host_capacity.memory_mb
            )));
        }

        verify_image(&spec.kernel_path, &spec.rootfs_path, &guard.manifest)?;

        let vm_id = new_id();
        if spec.metadata.get(SIMULATE_BOOT_TIMEOUT).map(String::as_str) == Some("true") {
            drop(guard);
            self.emit_state_change(&vm_id, VmState::Provisioning, VmState::Error, "boot timed out");
            return Err(HyperforgeError::BootTimeout(self.boot_timeout_ms));
        }

        let (host_channel, guest_channel) = VsockChannel::pair();
        let mut instance = VmInstance {
            id: vm_id.clone(),
            provider: spec.provider,
            spec: spec.clone(),
            state: VmState::Provisioning,
            pid: None,
            vsock_cid: Some(guard.instances.len() as u32 + 1),
            created_at: now_ms(),
            metrics: VmMetrics::default(),
        };
        Self::apply_transition(&mut instance.state, VmState::Running, &vm_id)?;
        guard.instances.insert(
            vm_id.clone(),
            VmRecord {
                instance,
                channel: Arc::new(host_channel),
                guest_channel: Arc::new(guest_channel),
            },
        );
        drop(guard);

        self.emit_state_change(&vm_id, VmState::Provisioning, VmState::Running, "boot complete");
        self.events.emit(&HvmEvent::VmSpawned { vm_id: vm_id.clone() });
        Ok(vm_id)
    }

    /// Graceful-then-forced termination; repeated calls on an already
    /// terminated (or unknown) VM are a no-op, matching spec §4.9's
    /// idempotence requirement.
    pub fn terminate(&self, vm_id: &str, reason: &str) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        let Some(record) = guard.instances.get_mut(vm_id) else {
            return Ok(());
        };
        if record.instance.state == VmState::Terminated {
            return Ok(());
        }
        let from = Self::apply_transition(&mut record.instance.state, VmState::Terminated, vm_id)?;
        record.channel.close();
        drop(guard);

        self.emit_state_change(vm_id, from, VmState::Terminated, reason);
        self.events.emit(&HvmEvent::VmTerminated {
            vm_id: vm_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn get_status(&self, vm_id: &str) -> Result<VmInstance> {
        self.inner
            .read()
            .unwrap()
            .instances
            .get(vm_id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| HyperforgeError::VmNotFound(vm_id.to_string()))
    }

    pub fn list_vms(&self) -> Vec<VmInstance> {
        self.inner.read().unwrap().instances.values().map(|r| r.instance.clone()).collect()
    }

    pub fn get_metrics(&self) -> HypervisorMetrics {
        let guard = self.inner.read().unwrap();
        let (_, vcpus, memory) = Self::active_totals(&guard);
        HypervisorMetrics {
            total_vms: guard.instances.len(),
            running_vms: guard
                .instances
                .values()
                .filter(|r| r.instance.state == VmState::Running)
                .count(),
            vcpus_in_use: vcpus,
            memory_mb_in_use: memory,
        }
    }

    fn record_error(&self, guard: &mut Inner, vm_id: &str) {
        let now = now_ms();
        let window = guard.error_windows.entry(vm_id.to_string()).or_default();
        window.push_back(now);
        let cutoff = now.saturating_sub(self.health_warning_window_ms);
        while matches!(window.front(), Some(&t) if t < cutoff) {
            window.pop_front();
        }
        if window.len() as u32 > self.health_warning_threshold {
            self.events.emit(&HvmEvent::HealthWarning {
                vm_id: vm_id.to_string(),
                error_count: window.len() as u32,
            });
        }
    }

    /// Terminates `vm_id` and emits `security-violation`: the response to
    /// an agent attempting an out-of-scope operation (spec §4.9).
    pub fn report_security_violation(&self, vm_id: &str, description: &str) -> Result<()> {
        self.events.emit(&HvmEvent::SecurityViolation {
            vm_id: vm_id.to_string(),
            description: description.to_string(),
        });
        self.terminate(vm_id, &format!("security violation: {description}"))
    }

    /// Routes `task` through `vm_id`'s VSOCK channel. A VM whose spec opted
    /// into `__simulate_vsock_failure` has its channel dropped from under
    /// it right here, independent of `terminate` — a stand-in for a real
    /// transport-level disconnect — so the send below fails and the
    /// terminate-and-report path is exercised deterministically.
    pub fn execute_task(&self, vm_id: &str, task: TaskEnvelope, timeout: Duration) -> Result<ResultEnvelope> {
        let channel = {
            let guard = self.inner.read().unwrap();
            let record = guard
                .instances
                .get(vm_id)
                .ok_or_else(|| HyperforgeError::VmNotFound(vm_id.to_string()))?;
            if record.instance.state == VmState::Terminated {
                return Err(HyperforgeError::VmNotFound(vm_id.to_string()));
            }
            if record.instance.spec.metadata.get(SIMULATE_VSOCK_FAILURE).map(String::as_str) == Some("true") {
                tracing::warn!(vm_id, "simulating a VSOCK transport drop");
                record.channel.close();
            }
            record.channel.clone()
        };

        let ack = channel.send(task.clone()).map_err(|e| HyperforgeError::VsockDisconnected(e.to_string()));
        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                let mut guard = self.inner.write().unwrap();
                self.record_error(&mut guard, vm_id);
                drop(guard);
                self.terminate(vm_id, "VSOCK disconnected and reconnect failed")?;
                return Err(e);
            }
        };
        debug_assert_eq!(ack, task.task_id);

        match channel.receive(&task.task_id, timeout) {
            Ok(result) => Ok(result),
            Err(e) => {
                let mut guard = self.inner.write().unwrap();
                self.record_error(&mut guard, vm_id);
                drop(guard);
                Err(HyperforgeError::VsockDisconnected(e.to_string()))
            }
        }
    }

    /// Exposes the guest side of a spawned VM's channel so a HAL-side
    /// executor loop (or a test standing in for one) can answer
    /// `execute_task` calls.
    pub fn guest_channel(&self, vm_id: &str) -> Option<Arc<VsockChannel>> {
        self.inner.read().unwrap().instances.get(vm_id).map(|r| r.guest_channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn capacity() -> HostCapacity {
        HostCapacity { vcpus: 4, memory_mb: 2048 }
    }

    fn manifest_for(spec: &VmSpec) -> TrustedManifest {
        let mut manifest = TrustedManifest::default();
        manifest
            .kernels
            .insert(spec.kernel_path.clone(), trusted_digest_for(&spec.kernel_path));
        manifest
            .images
            .insert(spec.rootfs_path.clone(), trusted_digest_for(&spec.rootfs_path));
        manifest
    }

    fn spec(name: &str, vcpus: u32, memory_mb: u32) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            provider: Provider::Firecracker,
            vcpus,
            memory_mb,
            kernel_path: format!("/kernels/{name}"),
            rootfs_path: format!("/images/{name}"),
            network_enabled: false,
            drives: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn manager(host: HostCapacity, max_vms: usize) -> HypervisorManager {
        HypervisorManager::new(host, max_vms, 5_000, 2_000, 60_000, 10, TrustedManifest::default())
    }

    #[test]
    fn scenario_4_spawn_capacity_gate() {
        let s1 = spec("vm-1", 3, 1024);
        let s2 = spec("vm-2", 2, 1024);
        let mgr = manager(capacity(), 16);
        mgr.set_manifest({
            let mut m = manifest_for(&s1);
            m.kernels.insert(s2.kernel_path.clone(), trusted_digest_for(&s2.kernel_path));
            m.images.insert(s2.rootfs_path.clone(), trusted_digest_for(&s2.rootfs_path));
            m
        });

        let id1 = mgr.spawn(s1).unwrap();
        let err = mgr.spawn(s2).unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::ResourceExceeded);

        mgr.terminate(&id1, "scenario cleanup").unwrap();
        let s2_retry = spec("vm-2", 2, 1024);
        assert!(mgr.spawn(s2_retry).is_ok());
    }

    #[test]
    fn scenario_5_checksum_gate_blocks_spawn_and_registers_nothing() {
        let mgr = manager(capacity(), 16);
        let mut bad_spec = spec("vm-bad", 1, 256);
        let mut manifest = TrustedManifest::default();
        manifest.kernels.insert(bad_spec.kernel_path.clone(), "aaa".repeat(16));
        mgr.set_manifest(manifest);
        bad_spec.rootfs_path = "/images/vm-bad".to_string();

        let err = mgr.spawn(bad_spec).unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::ChecksumMismatch);
        assert!(mgr.list_vms().is_empty());
    }

    #[test]
    fn l8_spawn_uniqueness_and_queryability() {
        let mgr = manager(HostCapacity { vcpus: 64, memory_mb: 65536 }, 16);
        let specs: Vec<VmSpec> = (0..8).map(|i| spec(&format!("vm-{i}"), 1, 256)).collect();
        let mut manifest = TrustedManifest::default();
        for s in &specs {
            manifest.kernels.insert(s.kernel_path.clone(), trusted_digest_for(&s.kernel_path));
            manifest.images.insert(s.rootfs_path.clone(), trusted_digest_for(&s.rootfs_path));
        }
        mgr.set_manifest(manifest);

        let mut ids = std::collections::HashSet::new();
        for s in specs {
            let name = s.name.clone();
            let id = mgr.spawn(s).unwrap();
            assert!(ids.insert(id.clone()));
            assert_eq!(mgr.get_status(&id).unwrap().spec.name, name);
        }
    }

    #[test]
    fn l9_capacity_conserved_after_spawn_and_terminate_sequence() {
        let host = HostCapacity { vcpus: 8, memory_mb: 4096 };
        let mgr = manager(host, 16);
        let mut ids = Vec::new();
        for i in 0..4 {
            let s = spec(&format!("vm-{i}"), 2, 1024);
            mgr.set_manifest(manifest_for(&s));
            ids.push(mgr.spawn(s).unwrap());
        }
        let metrics = mgr.get_metrics();
        assert!(metrics.vcpus_in_use <= host.vcpus);
        assert!(metrics.memory_mb_in_use <= host.memory_mb);

        mgr.terminate(&ids[0], "done").unwrap();
        let metrics = mgr.get_metrics();
        assert_eq!(metrics.vcpus_in_use, 6);
        assert_eq!(metrics.memory_mb_in_use, 3072);
    }

    #[test]
    fn terminate_is_idempotent() {
        let s = spec("vm-idem", 1, 256);
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let id = mgr.spawn(s).unwrap();
        mgr.terminate(&id, "first").unwrap();
        mgr.terminate(&id, "second").unwrap();
        assert_eq!(mgr.get_status(&id).unwrap().state, VmState::Terminated);
    }

    #[test]
    fn terminate_on_unknown_vm_is_a_no_op() {
        let mgr = manager(capacity(), 16);
        assert!(mgr.terminate("does-not-exist", "noop").is_ok());
    }

    #[test]
    fn boot_timeout_is_simulated_via_metadata_flag_and_nothing_is_registered() {
        let mut s = spec("vm-timeout", 1, 256);
        s.metadata.insert(SIMULATE_BOOT_TIMEOUT.to_string(), "true".to_string());
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let err = mgr.spawn(s).unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::BootTimeout);
        assert!(mgr.list_vms().is_empty());
    }

    #[test]
    fn execute_task_round_trips_through_the_vms_channel() {
        let s = spec("vm-exec", 1, 256);
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let id = mgr.spawn(s).unwrap();

        let guest = mgr.guest_channel(&id).unwrap();
        let handle = std::thread::spawn(move || {
            let task = guest.recv_task(std::time::Duration::from_millis(500)).unwrap();
            guest
                .respond(hyperforge_vsock::ResultEnvelope {
                    task_id: task.task_id,
                    exit_code: 0,
                    stdout: b"done".to_vec(),
                    stderr: Vec::new(),
                    duration_ms: 1,
                })
                .unwrap();
        });

        let task = TaskEnvelope {
            task_id: "t1".to_string(),
            command: "run".to_string(),
            args: Vec::new(),
            env: Map::new(),
            timeout_ms: 100,
        };
        let result = mgr
            .execute_task(&id, task, std::time::Duration::from_millis(500))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"done");
        handle.join().unwrap();
    }

    #[test]
    fn execute_task_on_terminated_vm_is_vm_not_found() {
        let s = spec("vm-exec-2", 1, 256);
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let id = mgr.spawn(s).unwrap();
        mgr.terminate(&id, "shutdown").unwrap();
        let task = TaskEnvelope {
            task_id: "t1".to_string(),
            command: "run".to_string(),
            args: Vec::new(),
            env: Map::new(),
            timeout_ms: 100,
        };
        let err = mgr
            .execute_task(&id, task, std::time::Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::VmNotFound);
    }

    #[test]
    fn vsock_failure_flag_drops_the_channel_and_terminates_the_vm() {
        let mut s = spec("vm-vsock-fail", 1, 256);
        s.metadata.insert(SIMULATE_VSOCK_FAILURE.to_string(), "true".to_string());
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let id = mgr.spawn(s).unwrap();

        let task = TaskEnvelope {
            task_id: "t1".to_string(),
            command: "run".to_string(),
            args: Vec::new(),
            env: Map::new(),
            timeout_ms: 100,
        };
        let err = mgr
            .execute_task(&id, task, std::time::Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::VsockDisconnected);
        assert_eq!(mgr.get_status(&id).unwrap().state, VmState::Terminated);
    }

    #[test]
    fn initialize_fails_with_no_providers() {
        let mgr = manager(capacity(), 16);
        assert!(mgr.initialize(&[]).is_err());
        assert!(mgr.initialize(&[Provider::Firecracker]).is_ok());
    }

    #[test]
    fn security_violation_terminates_the_vm() {
        let s = spec("vm-sec", 1, 256);
        let mgr = manager(capacity(), 16);
        mgr.set_manifest(manifest_for(&s));
        let id = mgr.spawn(s).unwrap();
        mgr.report_security_violation(&id, "attempted host filesystem escape").unwrap();
        assert_eq!(mgr.get_status(&id).unwrap().state, VmState::Terminated);
    }
}
