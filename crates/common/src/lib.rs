//! Small shared utilities used across every Hyperforge crate: canonical
//! JSON serialization (for hash-chaining), SHA-256 helpers, id generation,
//! and wall-clock timestamps.

pub mod canonical;
pub mod eventbus;
pub mod hashing;
pub mod ids;
pub mod time;

pub use canonical::canonical_json_bytes;
pub use eventbus::{EventBus, EventBusExt, Unsubscribe};
pub use hashing::{merkle_root, sha256_bytes, sha256_hex};
pub use ids::new_id;
pub use time::now_ms;
