//! Local file-based state storage backend.
//!
//! Layout under the base directory:
//!
//! - `resources/<type>/<name>.json`: one record per resource
//! - `state.lock`: the run lock record
//! - `history.json`: recent run history
//!
//! Every record is written to a temporary file, synced, then renamed over
//! the destination so readers never observe a partial write.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};
use crate::model::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::StateStore;
use super::types::{ResourceState, RunHistoryEntry, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".convergent";

/// Directory holding per-resource records.
const RESOURCES_DIR: &str = "resources";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// History file name.
const HISTORY_FILE: &str = "history.json";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding per-resource records.
    resources_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the history file.
    history_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();

        Self {
            resources_dir: base_dir.join(RESOURCES_DIR),
            lock_path: base_dir.join(LOCK_FILE),
            history_path: base_dir.join(HISTORY_FILE),
        }
    }

    /// Returns the record path for a resource.
    fn resource_path(&self, id: &ResourceId) -> PathBuf {
        self.resources_dir
            .join(&id.resource_type)
            .join(format!("{}.json", id.name))
    }

    /// Writes content to a temporary file, syncs it, then renames it into place.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StateError::storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::storage(format!("Failed to create {}: {e}", temp_path.display()))
        })?;

        file.write_all(content).await.map_err(|e| {
            StateError::storage(format!("Failed to write {}: {e}", temp_path.display()))
        })?;

        file.sync_all().await.map_err(|e| {
            StateError::storage(format!("Failed to sync {}: {e}", temp_path.display()))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StateError::storage(format!("Failed to rename into {}: {e}", path.display()))
        })?;

        Ok(())
    }

    /// Reads and parses a resource record.
    async fn read_record(path: &Path) -> Result<ResourceState> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read {}: {e}", path.display()))
        })?;

        let state: ResourceState = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        Ok(state)
    }

    /// Reads the lock file if it exists.
    ///
    /// An empty lock file belongs to a run that is still writing it and is
    /// reported as held by an unknown holder.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        if content.trim().is_empty() {
            return Err(StateError::LockHeld {
                run_id: String::from("unknown"),
                holder: String::from("unknown"),
                since: String::from("unknown"),
            }
            .into());
        }

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to create state directory: {e}"),
            })?;
        }

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn acquire_lock(&self, run_id: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(run_id);

        // Second pass only happens after removing an expired lock
        for _ in 0..2 {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock for run {run_id} (expires in {}s)",
                    LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockHeld {
                        run_id: existing.run_id,
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    warn!("Taking over expired lock held by run {}", existing.run_id);
                    self.delete_lock_file().await?;
                }
                None => debug!("Lock file vanished, retrying acquisition"),
            }
        }

        Err(StateError::LockFailed {
            message: String::from("Lock contention while replacing an expired lock"),
        }
        .into())
    }

    async fn refresh_lock(&self, run_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(mut existing) if existing.is_owned_by(run_id) => {
                existing.refresh();
                let content = serde_json::to_vec_pretty(&existing).map_err(|e| {
                    StateError::serialization(format!("Failed to serialize lock: {e}"))
                })?;
                Self::write_atomic(&self.lock_path, &content).await?;
                debug!("Refreshed state lock for run {run_id}");
                Ok(())
            }
            _ => Err(StateError::LockFailed {
                message: format!("Lock is no longer held by run {run_id}"),
            }
            .into()),
        }
    }

    async fn release_lock(&self, run_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.is_owned_by(run_id) {
                self.delete_lock_file().await?;
                info!("Released state lock for run {run_id}");
            } else {
                debug!(
                    "Lock owner mismatch: expected {run_id}, found {}",
                    existing.run_id
                );
            }
        }
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await.unwrap_or(None);
        self.delete_lock_file().await?;
        warn!("State lock forcefully removed");
        Ok(existing)
    }

    async fn read_all(&self) -> Result<BTreeMap<ResourceId, ResourceState>> {
        let mut states = BTreeMap::new();

        let mut type_dirs = match fs::read_dir(&self.resources_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state recorded yet at {}", self.resources_dir.display());
                return Ok(states);
            }
            Err(e) => return Err(StateError::storage(format!("Failed to list state: {e}")).into()),
        };

        while let Some(type_dir) = type_dirs
            .next_entry()
            .await
            .map_err(|e| StateError::storage(format!("Failed to list state: {e}")))?
        {
            if !type_dir.path().is_dir() {
                continue;
            }

            let mut records = fs::read_dir(type_dir.path())
                .await
                .map_err(|e| StateError::storage(format!("Failed to list state: {e}")))?;

            while let Some(record) = records
                .next_entry()
                .await
                .map_err(|e| StateError::storage(format!("Failed to list state: {e}")))?
            {
                let path = record.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    let state = Self::read_record(&path).await?;
                    states.insert(state.id.clone(), state);
                }
            }
        }

        info!("Loaded {} resource states", states.len());
        Ok(states)
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<ResourceState>> {
        let path = self.resource_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn write(&self, state: &ResourceState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state).map_err(|e| {
            StateError::serialization(format!("Failed to serialize state for {}: {e}", state.id))
        })?;

        Self::write_atomic(&self.resource_path(&state.id), &content).await?;
        debug!("Wrote state for {} (revision {})", state.id, state.revision);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        match fs::remove_file(self.resource_path(id)).await {
            Ok(()) => {
                debug!("Deleted state for {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::storage(format!("Failed to delete state for {id}: {e}")).into()),
        }
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        let mut history = self.history().await?;
        RunHistoryEntry::push_bounded(&mut history, entry);

        let content = serde_json::to_vec_pretty(&history)
            .map_err(|e| StateError::serialization(format!("Failed to serialize history: {e}")))?;
        Self::write_atomic(&self.history_path, &content).await
    }

    async fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        match fs::read_to_string(&self.history_path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                StateError::corrupted(format!("Failed to parse history: {e}")).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StateError::storage(format!("Failed to read history: {e}")).into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn sample_state(name: &str) -> ResourceState {
        let attributes = BTreeMap::from([(String::from("content"), Value::from("hello"))]);
        ResourceState::new(ResourceId::new("file", name), attributes)
    }

    #[tokio::test]
    async fn test_write_and_read_all() {
        let (store, _temp) = create_test_store();

        store.write(&sample_state("motd")).await.expect("write");
        store.write(&sample_state("issue")).await.expect("write");

        let states = store.read_all().await.expect("read_all");
        assert_eq!(states.len(), 2);
        assert!(states.contains_key(&ResourceId::new("file", "motd")));

        let single = store
            .read(&ResourceId::new("file", "issue"))
            .await
            .expect("read")
            .expect("state should exist");
        assert_eq!(single.attributes, sample_state("issue").attributes);
        assert_eq!(single.revision, 1);
    }

    #[tokio::test]
    async fn test_read_all_empty() {
        let (store, _temp) = create_test_store();
        assert!(store.read_all().await.expect("read_all").is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp) = create_test_store();
        let state = sample_state("motd");

        store.write(&state).await.expect("write");
        store.delete(&state.id).await.expect("delete");
        store.delete(&state.id).await.expect("second delete is a no-op");

        assert!(store.read(&state.id).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (store, _temp) = create_test_store();
        let mut state = sample_state("motd");
        state.version = String::from("0.1");
        store.write(&state).await.expect("write");

        let err = store.read_all().await.expect_err("old version must be rejected");
        assert!(matches!(err, ConvergeError::State(StateError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        store.acquire_lock("run-1").await.expect("Failed to acquire lock");
        assert!(store.lock_info().await.expect("lock_info").is_some());

        store.refresh_lock("run-1").await.expect("refresh");
        store.release_lock("run-1").await.expect("Failed to release lock");

        assert!(store.lock_info().await.expect("lock_info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        store.acquire_lock("run-1").await.expect("first lock");

        let err = store.acquire_lock("run-2").await.expect_err("second lock must fail");
        assert!(matches!(err, ConvergeError::State(StateError::LockHeld { ref run_id, .. }) if run_id == "run-1"));

        // Releasing with the wrong run id leaves the lock in place
        store.release_lock("run-2").await.expect("release");
        assert!(store.lock_info().await.expect("lock_info").is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        LocalStateStore::write_atomic(
            &store.lock_path,
            &serde_json::to_vec(&stale).expect("serialize"),
        )
        .await
        .expect("write stale lock");

        let lock = store.acquire_lock("run-2").await.expect("takeover");
        assert_eq!(lock.run_id, "run-2");
    }

    #[tokio::test]
    async fn test_concurrent_lock_exclusivity() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp_dir.path()));

        let mut join_set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            join_set.spawn(async move { store.acquire_lock(&format!("run-{i}")).await });
        }

        let mut acquired = 0;
        let mut held = 0;
        while let Some(result) = join_set.join_next().await {
            match result.expect("task panicked") {
                Ok(_) => acquired += 1,
                Err(ConvergeError::State(StateError::LockHeld { .. })) => held += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(acquired, 1);
        assert_eq!(held, 7);
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let (store, _temp) = create_test_store();
        assert!(store.history().await.expect("history").is_empty());

        store
            .append_history(RunHistoryEntry {
                run_id: String::from("run-1"),
                timestamp: Utc::now(),
                success: true,
                changed: 2,
                failed: 0,
                skipped: 0,
                cancelled: false,
                error: None,
            })
            .await
            .expect("append");

        let history = store.history().await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].changed, 2);
    }
}
