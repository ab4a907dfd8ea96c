//! Layered host configuration.
//!
//! `HostConfig` is deserialized from a TOML file (with every section
//! defaulted via `#[serde(default)]`, matching the reference workspace's
//! config style) and describes the on-disk data directory layout from
//! spec §6, the host resource capacity from §8 scenario 4, and the
//! runtime tunables referenced throughout §4 (`max_payload_bytes`,
//! `boot_timeout_ms`, ...). CLI flags are layered on top by the binary
//! crate, not here.

use std::path::{Path, PathBuf};

use hyperforge_types::vm::HostCapacity;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Layout of the platform-controlled data directory (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDirLayout {
    pub root: PathBuf,
}

impl DataDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn agent_config(&self, agent: &str) -> PathBuf {
        self.root
            .join("hypervisor/configs/agents")
            .join(format!("{agent}.toml"))
    }

    pub fn provider_default(&self, provider: &str) -> PathBuf {
        self.root
            .join("hypervisor/configs/defaults")
            .join(format!("{provider}.toml"))
    }

    pub fn policy(&self, name: &str) -> PathBuf {
        self.root
            .join("hypervisor/policies")
            .join(format!("{name}.policy"))
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("hypervisor/registry.json")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("hypervisor/manifest.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("hypervisor/audit.jsonl")
    }

    pub fn hypercore_log_dir(&self, log_name: &str) -> PathBuf {
        self.root.join("hypercore").join(log_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "defaults::max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "defaults::boot_timeout_ms")]
    pub boot_timeout_ms: u64,
    #[serde(default = "defaults::grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "defaults::max_concurrent_vms")]
    pub max_concurrent_vms: usize,
    #[serde(default = "defaults::health_warning_window_ms")]
    pub health_warning_window_ms: u64,
    #[serde(default = "defaults::health_warning_threshold")]
    pub health_warning_threshold: u32,
    #[serde(default = "defaults::max_events")]
    pub max_events: usize,
    #[serde(default = "defaults::error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "defaults::error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: defaults::max_payload_bytes(),
            boot_timeout_ms: defaults::boot_timeout_ms(),
            grace_period_ms: defaults::grace_period_ms(),
            max_concurrent_vms: defaults::max_concurrent_vms(),
            health_warning_window_ms: defaults::health_warning_window_ms(),
            health_warning_threshold: defaults::health_warning_threshold(),
            max_events: defaults::max_events(),
            error_window_secs: defaults::error_window_secs(),
            error_threshold: defaults::error_threshold(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
        }
    }
}

mod defaults {
    pub fn max_payload_bytes() -> usize {
        1024 * 1024
    }
    pub fn boot_timeout_ms() -> u64 {
        10_000
    }
    pub fn grace_period_ms() -> u64 {
        5_000
    }
    pub fn max_concurrent_vms() -> usize {
        16
    }
    pub fn health_warning_window_ms() -> u64 {
        60_000
    }
    pub fn health_warning_threshold() -> u32 {
        10
    }
    pub fn max_events() -> usize {
        1000
    }
    pub fn error_window_secs() -> u64 {
        60
    }
    pub fn error_threshold() -> u32 {
        10
    }
    pub fn heartbeat_interval_ms() -> u64 {
        5_000
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostConfigCapacity {
    pub vcpus: u32,
    pub memory_mb: u32,
}

impl From<HostConfigCapacity> for HostCapacity {
    fn from(c: HostConfigCapacity) -> Self {
        HostCapacity {
            vcpus: c.vcpus,
            memory_mb: c.memory_mb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub host_capacity: HostConfigCapacity,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            host_capacity: HostConfigCapacity {
                vcpus: 4,
                memory_mb: 8192,
            },
            runtime: RuntimeConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn layout(&self) -> DataDirLayout {
        DataDirLayout::new(&self.data_dir)
    }
}
