//! Local file-based state storage backend.
//!
//! This module provides file-based state storage for local development and
//! single-machine runs. State lives in `.converge/state.json`; the run lock
//! in `.converge/state.lock`. The lock is written to a private file first and
//! then hard-linked into place, so it never appears empty and two processes
//! cannot both believe they hold it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated, unreadable_conflict};
use super::store::StateStore;
use super::types::StackState;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes file writes issued from this process.
    io: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            io: Mutex::new(()),
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a synced temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            ConvergeError::State(StateError::write(format!("Failed to create temp file: {e}")))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            ConvergeError::State(StateError::write(format!("Failed to write temp file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            ConvergeError::State(StateError::write(format!("Failed to sync temp file: {e}")))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            ConvergeError::State(StateError::write(format!("Failed to rename temp file: {e}")))
        })?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvergeError::State(StateError::corrupted(format!(
                    "Failed to read lock file: {e}"
                ))));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// A path next to the lock file that no other run will use.
    fn private_lock_path(&self, purpose: &str) -> PathBuf {
        let suffix = Uuid::new_v4().simple();
        self.base_dir.join(format!("{LOCK_FILE}.{suffix}.{purpose}"))
    }

    /// Publishes the lock file; fails with `AlreadyExists` if one is present.
    ///
    /// The content is complete before the lock path exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let staged = self.private_lock_path("new");
        let mut file = fs::File::create(&staged).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        let published = fs::hard_link(&staged, &self.lock_path).await;
        if let Err(e) = fs::remove_file(&staged).await {
            warn!("Failed to remove staged lock {}: {e}", staged.display());
        }
        published
    }

    /// Removes the lock file if it still holds the expired lock `stale`.
    ///
    /// The file is first renamed to a private path, so only one run can claim
    /// it. If what was claimed is a newer lock, it is put back. Returns
    /// whether the stale lock was removed.
    async fn remove_stale_lock(&self, stale: &LockInfo) -> Result<bool> {
        let claimed = self.private_lock_path("stale");
        match fs::rename(&self.lock_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to claim expired lock: {e}"),
                }));
            }
        }

        let content = fs::read_to_string(&claimed).await.unwrap_or_default();
        let is_stale = serde_json::from_str::<LockInfo>(&content)
            .is_ok_and(|claimed| claimed.lock_id == stale.lock_id);

        if !is_stale {
            debug!("Lock changed hands while expiring {}; restoring it", stale.lock_id);
            match fs::hard_link(&claimed, &self.lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => warn!("Failed to restore lock file: {e}"),
            }
        }
        if let Err(e) = fs::remove_file(&claimed).await {
            warn!("Failed to remove claimed lock {}: {e}", claimed.display());
        }
        Ok(is_stale)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to read state file: {e}")))
        })?;

        let state: StackState = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse state file: {e}")))
        })?;

        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let _guard = self.io.lock().await;
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.write_atomic(&self.state_path, &content).await?;

        debug!(
            "State saved to {} ({} records)",
            self.state_path.display(),
            state.records.len()
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.io.lock().await;
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!("Failed to delete state file: {e}")))
            })?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, run_id: &str, holder: &str) -> Result<LockInfo> {
        let _guard = self.io.lock().await;
        self.ensure_dir().await?;

        let lock_info = LockInfo::new(run_id, &holder_or_generated(holder));

        // Two attempts: the second one follows the removal of an expired lock.
        for _ in 0..2 {
            match self.create_lock_file(&lock_info).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock {} for {run_id} (expires in {LOCK_EXPIRY_SECS}s)",
                        lock_info.lock_id
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await {
                        Ok(Some(existing)) if !existing.is_expired() => {
                            return Err(ConvergeError::State(existing.conflict()));
                        }
                        Ok(Some(existing)) => {
                            warn!(
                                "Taking over expired lock held by {} (run {})",
                                existing.holder, existing.run_id
                            );
                            if !self.remove_stale_lock(&existing).await? {
                                return Err(ConvergeError::State(
                                    self.read_lock_file()
                                        .await
                                        .ok()
                                        .flatten()
                                        .as_ref()
                                        .map_or_else(unreadable_conflict, LockInfo::conflict),
                                ));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Lock file exists but is unreadable: {e}");
                            return Err(ConvergeError::State(unreadable_conflict()));
                        }
                    }
                }
                Err(e) => {
                    return Err(ConvergeError::State(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }));
                }
            }
        }

        Err(ConvergeError::State(StateError::LockFailed {
            message: String::from("lock file keeps reappearing; another run is starting"),
        }))
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        let Some(mut existing) = self.read_lock_file().await? else {
            return Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Lock {lock_id} is no longer held"),
            }));
        };

        if existing.lock_id != lock_id {
            return Err(ConvergeError::State(existing.conflict()));
        }

        existing.refresh();
        let content = serde_json::to_string_pretty(&existing).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.write_atomic(&self.lock_path, &content).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        let _guard = self.io.lock().await;
        self.delete_lock_file().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResourceId};
    use crate::state::StateRecord;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = StackState::new("todo-app", "dev");
        state.set_record(StateRecord::new(
            ResourceId::new("table", "aws:dynamodb:Table"),
            Outputs::new("tbl-1"),
            BTreeMap::new(),
            vec![],
            String::from("h"),
        ));
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded, state);
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        std::fs::write(store.state_path(), "{not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("run-1", "test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));
        store.refresh_lock(&lock.lock_id).await.expect("refresh failed");

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_concurrent_run_is_refused() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("run-1", "holder-1")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("run-2", "holder-2").await.unwrap_err();
        match err {
            ConvergeError::State(StateError::ConcurrentRun { run_id, holder, .. }) => {
                assert_eq!(run_id, "run-1");
                assert_eq!(holder, "holder-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();

        let mut stale = LockInfo::new("run-old", "gone");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(&store.lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = store.acquire_lock("run-new", "me").await.unwrap();
        assert_eq!(store.lock_info().await.unwrap().unwrap().lock_id, lock.lock_id);
        assert_eq!(std::fs::read_dir(&store.base_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_lock_counts_as_held() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        std::fs::write(&store.lock_path, "").unwrap();

        let err = store.acquire_lock("run-2", "holder-2").await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::State(StateError::ConcurrentRun { ref holder, .. }) if holder == "unknown"
        ));
        assert!(store.lock_path.exists());

        store.force_unlock().await.unwrap();
        store.acquire_lock("run-2", "holder-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_removal_spares_a_newer_lock() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();

        let mut stale = LockInfo::new("run-old", "gone");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        // Another run replaced the expired lock after it was read.
        let fresh = store.acquire_lock("run-new", "other").await.unwrap();

        assert!(!store.remove_stale_lock(&stale).await.unwrap());
        assert_eq!(store.lock_info().await.unwrap().unwrap().lock_id, fresh.lock_id);

        let leftovers = std::fs::read_dir(&store.base_dir).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (store, _temp) = create_test_store();
        let _lock = store.acquire_lock("run-1", "h").await.unwrap();

        store.release_lock("not-mine").await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.force_unlock().await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }
}
