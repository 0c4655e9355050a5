//! In-memory state store.
//!
//! Used for tests and dry runs. Honors the same locking rules as the
//! local backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::model::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{ResourceState, RunHistoryEntry};

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceId, ResourceState>,
    lock: Option<LockInfo>,
    history: Vec<RunHistoryEntry>,
}

/// State store that keeps everything in process memory.
#[derive(Debug)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    lock_ttl: chrono::Duration,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lock_ttl: chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a lock stays valid without a refresh.
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Creates a store pre-populated with resource states.
    #[must_use]
    pub fn with_states(states: impl IntoIterator<Item = ResourceState>) -> Self {
        let resources = states.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            inner: Mutex::new(Inner {
                resources,
                ..Inner::default()
            }),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn acquire_lock(&self, run_id: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = &inner.lock
            && !existing.is_expired()
        {
            return Err(StateError::LockHeld {
                run_id: existing.run_id.clone(),
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let lock_info = LockInfo::new(run_id).expiring_in(self.lock_ttl);
        inner.lock = Some(lock_info.clone());
        debug!("Acquired in-memory lock for run {run_id}");
        Ok(lock_info)
    }

    async fn refresh_lock(&self, run_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.lock.as_mut() {
            Some(lock) if lock.is_owned_by(run_id) => {
                lock.extend(self.lock_ttl);
                Ok(())
            }
            _ => Err(StateError::LockFailed {
                message: format!("Lock is no longer held by run {run_id}"),
            }
            .into()),
        }
    }

    async fn release_lock(&self, run_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.is_owned_by(run_id)) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.take())
    }

    async fn read_all(&self) -> Result<BTreeMap<ResourceId, ResourceState>> {
        Ok(self.inner.lock().await.resources.clone())
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<ResourceState>> {
        Ok(self.inner.lock().await.resources.get(id).cloned())
    }

    async fn write(&self, state: &ResourceState) -> Result<()> {
        self.inner
            .lock()
            .await
            .resources
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.inner.lock().await.resources.remove(id);
        Ok(())
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        RunHistoryEntry::push_bounded(&mut self.inner.lock().await.history, entry);
        Ok(())
    }

    async fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        Ok(self.inner.lock().await.history.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
