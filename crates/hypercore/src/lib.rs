//! The append-only log store (spec §4.1) and its two collaborators: the
//! `Corestore` (a named map of lazily-constructed logs) and the
//! `OfflineQueue` (spec §4.5).

pub mod corestore;
pub mod log_store;
pub mod offline;

pub use corestore::Corestore;
pub use log_store::LogStore;
pub use offline::OfflineQueue;
