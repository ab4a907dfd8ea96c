//! Stable error vocabulary (spec §6) behind a `thiserror` enum.
//!
//! Every fallible public operation in the workspace ultimately returns
//! `Result<T, HyperforgeError>`. Sub-crates are free to define narrower,
//! local error enums (see `hyperforge_hac::ParseError`,
//! `hyperforge_vsock::FrameError`, ...) and convert into this type at the
//! crate boundary via `#[from]` or an explicit `.map_err`.

use serde::{Deserialize, Serialize};

/// The stable, caller-facing discriminant for every error the runtime can
/// produce. Kept separate from [`HyperforgeError`] so that the code can be
/// serialized (e.g. into an [`crate::audit::AuditEvent`]) without dragging
/// the human-readable message along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    HalNotFound,
    ContainerdUnavailable,
    ProviderUnavailable,
    InvalidConfig,
    ResourceExceeded,
    MaxVmsExceeded,
    BootTimeout,
    VmNotFound,
    VsockDisconnected,
    PolicyDenied,
    SecurityViolation,
    ChecksumMismatch,
    PluginUnverified,
    CleanupFailed,
    RemoteUnreachable,
    IoError,
    OutOfRange,
    PayloadTooLarge,
    DeserializationFailed,
    Unauthorized,
    SignatureVerificationFailed,
    PeerTimeout,
    Unknown,
}

impl ErrorCode {
    /// The taxonomy bucket from spec §7, used to decide propagation policy
    /// (surface immediately, retry-then-surface, or log-and-skip).
    pub fn category(self) -> ErrorCategory {
        use ErrorCategory::*;
        match self {
            ErrorCode::InvalidConfig | ErrorCode::OutOfRange | ErrorCode::PayloadTooLarge => Input,
            ErrorCode::ResourceExceeded | ErrorCode::MaxVmsExceeded => Capacity,
            ErrorCode::HalNotFound
            | ErrorCode::ContainerdUnavailable
            | ErrorCode::ProviderUnavailable
            | ErrorCode::RemoteUnreachable
            | ErrorCode::IoError => Environment,
            ErrorCode::BootTimeout | ErrorCode::PeerTimeout => Timing,
            ErrorCode::PolicyDenied
            | ErrorCode::SecurityViolation
            | ErrorCode::ChecksumMismatch
            | ErrorCode::PluginUnverified
            | ErrorCode::Unauthorized
            | ErrorCode::SignatureVerificationFailed => Security,
            ErrorCode::DeserializationFailed => Replication,
            ErrorCode::VmNotFound
            | ErrorCode::VsockDisconnected
            | ErrorCode::CleanupFailed
            | ErrorCode::Unknown => Environment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Capacity,
    Environment,
    Timing,
    Security,
    Replication,
}

#[derive(Debug, thiserror::Error)]
pub enum HyperforgeError {
    #[error("HAL binary not found: {0}")]
    HalNotFound(String),
    #[error("containerd is unreachable: {0}")]
    ContainerdUnavailable(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },
    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),
    #[error("maximum concurrent VMs ({max}) exceeded")]
    MaxVmsExceeded { max: usize },
    #[error("boot timed out after {0}ms")]
    BootTimeout(u64),
    #[error("VM `{0}` not found")]
    VmNotFound(String),
    #[error("VSOCK channel disconnected: {0}")]
    VsockDisconnected(String),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("security violation on `{vm_id}`: {description}")]
    SecurityViolation { vm_id: String, description: String },
    #[error("checksum mismatch for `{path}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("plugin `{0}` is unverified")]
    PluginUnverified(String),
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("sequence {seq} out of range (length {length})")]
    OutOfRange { seq: u64, length: u64 },
    #[error("payload of {actual} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { actual: usize, limit: usize },
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),
    #[error("peer timed out after {0}ms")]
    PeerTimeout(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HyperforgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HyperforgeError::HalNotFound(_) => ErrorCode::HalNotFound,
            HyperforgeError::ContainerdUnavailable(_) => ErrorCode::ContainerdUnavailable,
            HyperforgeError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            HyperforgeError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            HyperforgeError::ResourceExceeded(_) => ErrorCode::ResourceExceeded,
            HyperforgeError::MaxVmsExceeded { .. } => ErrorCode::MaxVmsExceeded,
            HyperforgeError::BootTimeout(_) => ErrorCode::BootTimeout,
            HyperforgeError::VmNotFound(_) => ErrorCode::VmNotFound,
            HyperforgeError::VsockDisconnected(_) => ErrorCode::VsockDisconnected,
            HyperforgeError::PolicyDenied(_) => ErrorCode::PolicyDenied,
            HyperforgeError::SecurityViolation { .. } => ErrorCode::SecurityViolation,
            HyperforgeError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            HyperforgeError::PluginUnverified(_) => ErrorCode::PluginUnverified,
            HyperforgeError::CleanupFailed(_) => ErrorCode::CleanupFailed,
            HyperforgeError::RemoteUnreachable(_) => ErrorCode::RemoteUnreachable,
            HyperforgeError::IoError(_) => ErrorCode::IoError,
            HyperforgeError::OutOfRange { .. } => ErrorCode::OutOfRange,
            HyperforgeError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            HyperforgeError::DeserializationFailed(_) => ErrorCode::DeserializationFailed,
            HyperforgeError::Unauthorized(_) => ErrorCode::Unauthorized,
            HyperforgeError::SignatureVerificationFailed(_) => {
                ErrorCode::SignatureVerificationFailed
            }
            HyperforgeError::PeerTimeout(_) => ErrorCode::PeerTimeout,
            HyperforgeError::Other(_) => ErrorCode::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, HyperforgeError>;
