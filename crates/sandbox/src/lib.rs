//! Ultra-Sandbox Adapter, plugin signature verification, and the
//! Moltbot Deployer/Registry (spec §4.11). The Image Verifier itself
//! (SHA-256 digest comparison against a trusted manifest) lives in
//! `hyperforge_hypervisor`, since `HypervisorManager::spawn` already
//! runs it as gate (d); this crate reuses it rather than re-deriving it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use hyperforge_common::now_ms;
use hyperforge_hypervisor::HypervisorManager;
use hyperforge_types::vm::{SandboxPolicy, VmSpec, VmState};
use hyperforge_types::{HyperforgeError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub denied_reason: Option<String>,
    pub policy_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyResult {
    pub vm_terminated: bool,
    pub host_state_clean: bool,
    pub residual_paths: Vec<String>,
}

struct SandboxRecord {
    mounted_paths: Vec<String>,
    simulate_cleanup_failure: bool,
}

/// Per-process owner of sandbox policies and the filesystem-mount
/// registry that keeps running sandboxes from sharing mounts (spec §9
/// "Singletons" — constructed explicitly, not a hidden global).
pub struct SandboxAdapter {
    hvm: Arc<HypervisorManager>,
    policies: RwLock<HashMap<String, SandboxPolicy>>,
    mounted_paths: RwLock<HashSet<String>>,
    records: RwLock<HashMap<String, SandboxRecord>>,
}

pub const SIMULATE_CLEANUP_FAILURE: &str = "__simulate_cleanup_failure";

impl SandboxAdapter {
    pub fn new(hvm: Arc<HypervisorManager>) -> Self {
        Self {
            hvm,
            policies: RwLock::new(HashMap::new()),
            mounted_paths: RwLock::new(HashSet::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_policy(&self, agent_id: &str, policy: SandboxPolicy) {
        self.policies.write().unwrap().insert(agent_id.to_string(), policy);
    }

    /// Deterministic: same `(agent_id, operation)` against the same
    /// policy set always returns the same decision (spec L7-style
    /// determinism, applied to sandbox policy rather than ACL policy).
    pub fn evaluate_policy(&self, agent_id: &str, operation: &str) -> PolicyDecision {
        let policy_id = format!("policy:{agent_id}");
        let guard = self.policies.read().unwrap();
        let Some(policy) = guard.get(agent_id) else {
            return PolicyDecision {
                allowed: false,
                denied_reason: Some(format!("no sandbox policy registered for agent `{agent_id}`")),
                policy_id,
            };
        };
        if policy.allowed_operations.iter().any(|op| op == operation) {
            PolicyDecision {
                allowed: true,
                denied_reason: None,
                policy_id,
            }
        } else {
            PolicyDecision {
                allowed: false,
                denied_reason: Some(format!("operation `{operation}` not permitted by policy")),
                policy_id,
            }
        }
    }

    /// Spawns a VM for `agent_id`'s `task`-shaped spec after loading and
    /// pre-evaluating its policy, forcing `network_enabled=false`, and
    /// rejecting any drive path already mounted by another running
    /// sandbox.
    pub fn spawn_sandboxed(&self, agent_id: &str, mut spec: VmSpec) -> Result<String> {
        let decision = self.evaluate_policy(agent_id, "spawn");
        if !decision.allowed {
            return Err(HyperforgeError::PolicyDenied(
                decision.denied_reason.unwrap_or_else(|| "denied".to_string()),
            ));
        }

        spec.network_enabled = false;
        let simulate_cleanup_failure = spec
            .metadata
            .get(SIMULATE_CLEANUP_FAILURE)
            .map(String::as_str)
            == Some("true");

        let mut mounts = self.mounted_paths.write().unwrap();
        for drive in &spec.drives {
            if mounts.contains(&drive.path) {
                return Err(HyperforgeError::PolicyDenied(format!(
                    "path `{}` is already mounted by another running sandbox",
                    drive.path
                )));
            }
        }
        let paths: Vec<String> = spec.drives.iter().map(|d| d.path.clone()).collect();
        for p in &paths {
            mounts.insert(p.clone());
        }
        drop(mounts);

        match self.hvm.spawn(spec) {
            Ok(vm_id) => {
                self.records.write().unwrap().insert(
                    vm_id.clone(),
                    SandboxRecord {
                        mounted_paths: paths,
                        simulate_cleanup_failure,
                    },
                );
                Ok(vm_id)
            }
            Err(e) => {
                let mut mounts = self.mounted_paths.write().unwrap();
                for p in &paths {
                    mounts.remove(p);
                }
                Err(e)
            }
        }
    }

    /// Terminates the VM and releases its mounts. A cleanup failure
    /// (simulated via `__simulate_cleanup_failure` on the original
    /// spec, since there is no real filesystem to fail unmounting here)
    /// leaves the paths mounted and reports them as residual; a later
    /// `retry_cleanup` call (mirroring "retry on next initialize") can
    /// release them.
    pub fn destroy_sandbox(&self, vm_id: &str) -> Result<DestroyResult> {
        self.hvm.terminate(vm_id, "sandbox destroyed")?;

        let record = self.records.write().unwrap().remove(vm_id);
        let Some(record) = record else {
            return Ok(DestroyResult {
                vm_terminated: true,
                host_state_clean: true,
                residual_paths: Vec::new(),
            });
        };

        if record.simulate_cleanup_failure {
            tracing::warn!(vm_id, "sandbox cleanup failed; leaving residual mounts");
            let residual = record.mounted_paths.clone();
            self.records.write().unwrap().insert(vm_id.to_string(), record);
            return Ok(DestroyResult {
                vm_terminated: true,
                host_state_clean: false,
                residual_paths: residual,
            });
        }

        let mut mounts = self.mounted_paths.write().unwrap();
        for p in &record.mounted_paths {
            mounts.remove(p);
        }
        Ok(DestroyResult {
            vm_terminated: true,
            host_state_clean: true,
            residual_paths: Vec::new(),
        })
    }

    /// Retries cleanup for every sandbox left with residual mounts,
    /// meant to be called on manager initialize.
    pub fn retry_cleanup(&self) -> usize {
        let vm_ids: Vec<String> = self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.simulate_cleanup_failure)
            .map(|(id, _)| id.clone())
            .collect();
        let mut cleaned = 0;
        for vm_id in vm_ids {
            if let Some(mut record) = self.records.write().unwrap().remove(&vm_id) {
                record.simulate_cleanup_failure = false;
                let mut mounts = self.mounted_paths.write().unwrap();
                for p in &record.mounted_paths {
                    mounts.remove(p);
                }
                cleaned += 1;
            }
        }
        cleaned
    }
}

/// Verifies a plugin's signature against a keyring of expected
/// signatures, failing closed when the plugin has no entry at all.
pub fn verify_plugin_signature(
    plugin_name: &str,
    signature: &str,
    keyring: &HashMap<String, String>,
) -> Result<()> {
    match keyring.get(plugin_name) {
        Some(expected) if expected == signature => Ok(()),
        _ => Err(HyperforgeError::PluginUnverified(plugin_name.to_string())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDeployment {
    pub agent_name: String,
    pub vm_id: String,
    pub state: VmState,
    pub spec: VmSpec,
    pub deployed_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DeployOverrides {
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub metadata: HashMap<String, String>,
}

impl DeployOverrides {
    fn apply(&self, mut spec: VmSpec) -> VmSpec {
        if let Some(vcpus) = self.vcpus {
            spec.vcpus = vcpus;
        }
        if let Some(memory_mb) = self.memory_mb {
            spec.memory_mb = memory_mb;
        }
        for (k, v) in &self.metadata {
            spec.metadata.insert(k.clone(), v.clone());
        }
        spec
    }
}

/// Loads a named agent's spec, spawns it through the sandbox adapter,
/// and maintains an in-memory deployment map periodically persisted to
/// `registry.json` (spec §4.11 "Deployer/Registry").
pub struct MoltbotRegistry {
    sandbox: Arc<SandboxAdapter>,
    path: PathBuf,
    deployments: RwLock<HashMap<String, AgentDeployment>>,
}

impl MoltbotRegistry {
    pub fn new(sandbox: Arc<SandboxAdapter>, path: impl Into<PathBuf>) -> Self {
        Self {
            sandbox,
            path: path.into(),
            deployments: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the in-memory map from disk, if a registry file exists.
    /// Called on startup.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|e| HyperforgeError::IoError(e.to_string()))?;
        let loaded: HashMap<String, AgentDeployment> =
            serde_json::from_str(&text).map_err(|e| HyperforgeError::DeserializationFailed(e.to_string()))?;
        *self.deployments.write().unwrap() = loaded;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let guard = self.deployments.read().unwrap();
        let text = serde_json::to_string_pretty(&*guard).map_err(|e| HyperforgeError::DeserializationFailed(e.to_string()))?;
        drop(guard);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HyperforgeError::IoError(e.to_string()))?;
        }
        std::fs::write(&self.path, text).map_err(|e| HyperforgeError::IoError(e.to_string()))
    }

    pub fn deploy(&self, agent_name: &str, base_spec: VmSpec, overrides: DeployOverrides) -> Result<String> {
        let spec = overrides.apply(base_spec);
        let vm_id = self.sandbox.spawn_sandboxed(agent_name, spec.clone())?;
        self.deployments.write().unwrap().insert(
            agent_name.to_string(),
            AgentDeployment {
                agent_name: agent_name.to_string(),
                vm_id: vm_id.clone(),
                state: VmState::Running,
                spec,
                deployed_at: now_ms(),
            },
        );
        self.persist()?;
        Ok(vm_id)
    }

    pub fn undeploy(&self, agent_name: &str) -> Result<DestroyResult> {
        let deployment = self
            .deployments
            .write()
            .unwrap()
            .remove(agent_name)
            .ok_or_else(|| HyperforgeError::VmNotFound(agent_name.to_string()))?;
        let result = self.sandbox.destroy_sandbox(&deployment.vm_id)?;
        self.persist()?;
        Ok(result)
    }

    pub fn get(&self, agent_name: &str) -> Option<AgentDeployment> {
        self.deployments.read().unwrap().get(agent_name).cloned()
    }

    pub fn list(&self) -> Vec<AgentDeployment> {
        self.deployments.read().unwrap().values().cloned().collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperforge_types::vm::{DriveSpec, HostCapacity, Provider, TrustedManifest};

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            provider: Provider::Firecracker,
            vcpus: 1,
            memory_mb: 256,
            kernel_path: format!("/kernels/{name}"),
            rootfs_path: format!("/images/{name}"),
            network_enabled: true,
            drives: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    fn adapter() -> Arc<SandboxAdapter> {
        let mut manifest = TrustedManifest::default();
        for name in ["agent-a", "agent-b", "agent-c"] {
            let s = spec(name);
            manifest
                .kernels
                .insert(s.kernel_path.clone(), hyperforge_hypervisor::trusted_digest_for(&s.kernel_path));
            manifest
                .images
                .insert(s.rootfs_path.clone(), hyperforge_hypervisor::trusted_digest_for(&s.rootfs_path));
        }
        let hvm = Arc::new(HypervisorManager::new(
            HostCapacity { vcpus: 16, memory_mb: 8192 },
            16,
            5_000,
            2_000,
            60_000,
            10,
            manifest,
        ));
        Arc::new(SandboxAdapter::new(hvm))
    }

    fn allow_policy(op: &str) -> SandboxPolicy {
        SandboxPolicy {
            agent_id: "agent".to_string(),
            allowed_operations: vec![op.to_string()],
            max_memory_mb: 512,
            max_cpu_percent: 50,
            network_access: false,
            filesystem_access: Vec::new(),
        }
    }

    #[test]
    fn spawn_sandboxed_forces_network_disabled() {
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("spawn"));
        let vm_id = adapter.spawn_sandboxed("agent-a", spec("agent-a")).unwrap();
        let status = adapter.hvm.get_status(&vm_id).unwrap();
        assert!(!status.spec.network_enabled);
    }

    #[test]
    fn spawn_without_policy_is_denied() {
        let adapter = adapter();
        let err = adapter.spawn_sandboxed("agent-a", spec("agent-a")).unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::PolicyDenied);
    }

    #[test]
    fn two_sandboxes_cannot_share_a_mounted_drive() {
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("spawn"));
        adapter.set_policy("agent-b", allow_policy("spawn"));

        let mut a = spec("agent-a");
        a.drives.push(DriveSpec { path: "/data/shared".to_string(), read_only: false });
        adapter.spawn_sandboxed("agent-a", a).unwrap();

        let mut b = spec("agent-b");
        b.drives.push(DriveSpec { path: "/data/shared".to_string(), read_only: false });
        let err = adapter.spawn_sandboxed("agent-b", b).unwrap_err();
        assert_eq!(err.code(), hyperforge_types::ErrorCode::PolicyDenied);
    }

    #[test]
    fn destroy_sandbox_reports_clean_state_by_default() {
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("spawn"));
        let vm_id = adapter.spawn_sandboxed("agent-a", spec("agent-a")).unwrap();
        let result = adapter.destroy_sandbox(&vm_id).unwrap();
        assert!(result.vm_terminated);
        assert!(result.host_state_clean);
        assert!(result.residual_paths.is_empty());
    }

    #[test]
    fn destroy_sandbox_reports_residual_paths_on_simulated_cleanup_failure() {
        let adapter = adapter();
        adapter.set_policy("agent-c", allow_policy("spawn"));
        let mut s = spec("agent-c");
        s.drives.push(DriveSpec { path: "/data/c".to_string(), read_only: false });
        s.metadata.insert(SIMULATE_CLEANUP_FAILURE.to_string(), "true".to_string());
        let vm_id = adapter.spawn_sandboxed("agent-c", s).unwrap();

        let result = adapter.destroy_sandbox(&vm_id).unwrap();
        assert!(!result.host_state_clean);
        assert_eq!(result.residual_paths, vec!["/data/c".to_string()]);

        let cleaned = adapter.retry_cleanup();
        assert_eq!(cleaned, 1);
    }

    #[test]
    fn evaluate_policy_is_deterministic() {
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("read"));
        let a = adapter.evaluate_policy("agent-a", "write");
        let b = adapter.evaluate_policy("agent-a", "write");
        assert_eq!(a.allowed, b.allowed);
        assert_eq!(a.denied_reason, b.denied_reason);
    }

    #[test]
    fn plugin_signature_must_match_the_keyring() {
        let mut keyring = HashMap::new();
        keyring.insert("plugin-a".to_string(), "sig-123".to_string());
        assert!(verify_plugin_signature("plugin-a", "sig-123", &keyring).is_ok());
        assert!(verify_plugin_signature("plugin-a", "sig-wrong", &keyring).is_err());
        assert!(verify_plugin_signature("plugin-unknown", "anything", &keyring).is_err());
    }

    #[test]
    fn l10_registry_fidelity_across_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("spawn"));
        adapter.set_policy("agent-b", allow_policy("spawn"));
        let registry = MoltbotRegistry::new(adapter, dir.path().join("registry.json"));

        registry.deploy("agent-a", spec("agent-a"), DeployOverrides::default()).unwrap();
        registry.deploy("agent-b", spec("agent-b"), DeployOverrides { vcpus: Some(2), ..Default::default() }).unwrap();

        let reloaded = MoltbotRegistry::new(
            Arc::new(SandboxAdapter::new(Arc::new(HypervisorManager::new(
                HostCapacity { vcpus: 16, memory_mb: 8192 },
                16,
                5_000,
                2_000,
                60_000,
                10,
                TrustedManifest::default(),
            )))),
            registry.path().to_path_buf(),
        );
        reloaded.load().unwrap();

        let mut original = registry.list();
        let mut after = reloaded.list();
        original.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        after.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        assert_eq!(original, after);
    }

    #[test]
    fn undeploy_removes_from_registry_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter();
        adapter.set_policy("agent-a", allow_policy("spawn"));
        let registry = MoltbotRegistry::new(adapter, dir.path().join("registry.json"));
        registry.deploy("agent-a", spec("agent-a"), DeployOverrides::default()).unwrap();
        registry.undeploy("agent-a").unwrap();
        assert!(registry.get("agent-a").is_none());

        let text = std::fs::read_to_string(registry.path()).unwrap();
        let parsed: HashMap<String, AgentDeployment> = serde_json::from_str(&text).unwrap();
        assert!(parsed.is_empty());
    }
}
