//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Writes are per resource so that a crash mid-run leaves the store
//! consistent with whatever operations actually completed.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::ResourceId;

use super::lock::LockInfo;
use super::types::{ResourceState, RunHistoryEntry};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Acquires the exclusive run lock.
    ///
    /// Fails with `StateError::LockHeld` if another run holds an unexpired lock.
    async fn acquire_lock(&self, run_id: &str) -> Result<LockInfo>;

    /// Extends the expiry of a lock held by `run_id`.
    async fn refresh_lock(&self, run_id: &str) -> Result<()>;

    /// Releases the lock if it is held by `run_id`.
    async fn release_lock(&self, run_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Removes any lock regardless of owner, returning what was removed.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Returns a snapshot of every stored resource state.
    async fn read_all(&self) -> Result<BTreeMap<ResourceId, ResourceState>>;

    /// Reads the state of a single resource.
    async fn read(&self, id: &ResourceId) -> Result<Option<ResourceState>>;

    /// Atomically writes the state of a single resource.
    async fn write(&self, state: &ResourceState) -> Result<()>;

    /// Removes the state of a single resource.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Records a completed run.
    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()>;

    /// Returns recorded runs, oldest first.
    async fn history(&self) -> Result<Vec<RunHistoryEntry>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
