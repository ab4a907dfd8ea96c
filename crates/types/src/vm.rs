//! Hypervisor Manager data model (spec §3 "VM Spec", "VM Instance",
//! "Sandbox Policy", "Trusted Manifest").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Firecracker,
    CloudHypervisor,
    Unikernel,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Firecracker => "firecracker",
            Provider::CloudHypervisor => "cloud-hypervisor",
            Provider::Unikernel => "unikernel",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firecracker" => Ok(Provider::Firecracker),
            "cloud-hypervisor" => Ok(Provider::CloudHypervisor),
            "unikernel" => Ok(Provider::Unikernel),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSpec {
    pub path: String,
    pub read_only: bool,
}

/// Declarative VM specification (spec §3 "VM Spec").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub provider: Provider,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub kernel_path: String,
    pub rootfs_path: String,
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default)]
    pub drives: Vec<DriveSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl VmSpec {
    /// Field-level validation mirroring spec §3's range constraints. Returns
    /// the first violated field/expectation pair, if any.
    pub fn validate(&self) -> Result<(), (String, String)> {
        let name_ok = !self.name.is_empty()
            && self.name.len() <= 64
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err((
                "name".into(),
                "1-64 chars of [A-Za-z0-9_-]".into(),
            ));
        }
        if !(1..=64).contains(&self.vcpus) {
            return Err(("vcpus".into(), "integer in [1, 64]".into()));
        }
        if !(128..=65536).contains(&self.memory_mb) {
            return Err(("memory_mb".into(), "integer in [128, 65536]".into()));
        }
        if self.kernel_path.is_empty() {
            return Err(("kernel_path".into(), "non-empty path".into()));
        }
        if self.rootfs_path.is_empty() {
            return Err(("rootfs_path".into(), "non-empty path".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Provisioning,
    Running,
    Stopping,
    Terminated,
    Error,
}

impl VmState {
    /// Valid transitions per spec §4.9's state machine: linear progression,
    /// `terminated` reachable directly from `running` since `terminate` folds
    /// the graceful and forced phases into one atomic step, and `error`
    /// reachable from any non-terminal state.
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        if next == Error {
            return self != Terminated;
        }
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Terminated)
                | (Running, Stopping)
                | (Running, Terminated)
                | (Stopping, Terminated)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInstance {
    pub id: String,
    pub provider: Provider,
    pub spec: VmSpec,
    pub state: VmState,
    pub pid: Option<u32>,
    pub vsock_cid: Option<u32>,
    pub created_at: u64,
    pub metrics: VmMetrics,
}

/// Sandbox policy for an agent-owned VM (spec §3 "Sandbox Policy").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub agent_id: String,
    pub allowed_operations: Vec<String>,
    pub max_memory_mb: u32,
    pub max_cpu_percent: u32,
    pub network_access: bool,
    pub filesystem_access: Vec<String>,
}

/// Signed list of accepted image/kernel digests and plugin signatures
/// (spec §3 "Trusted Manifest").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustedManifest {
    pub images: HashMap<String, String>,
    pub kernels: HashMap<String, String>,
    pub plugins: HashMap<String, String>,
    pub updated_at: u64,
}

/// Host resource capacity against which spawns are conserved (spec §3
/// "Resource conservation", §8 scenario 4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vcpus: u32,
    pub memory_mb: u32,
}
