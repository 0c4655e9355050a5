//! State management for applied resources.
//!
//! This module provides persistent storage for the last-applied state of
//! each resource, the exclusive run lock, and a bounded run history.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, generate_run_id};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{ResourceState, RunHistoryEntry, STATE_VERSION};
