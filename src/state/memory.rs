//! In-memory state backend.
//!
//! Used for dry runs and tests. Nothing survives the process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::StackState;

/// Process-local state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<StackState>>,
    lock: Mutex<Option<LockInfo>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn acquire_lock(&self, run_id: &str, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        if let Some(existing) = lock.as_ref()
            && !existing.is_expired()
        {
            return Err(ConvergeError::State(existing.conflict()));
        }

        let info = LockInfo::new(run_id, &holder_or_generated(holder));
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        match lock.as_mut() {
            Some(existing) if existing.lock_id == lock_id => {
                existing.refresh();
                Ok(())
            }
            Some(existing) => Err(ConvergeError::State(existing.conflict())),
            None => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Lock {lock_id} is no longer held"),
            })),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());

        let state = StackState::new("app", "dev");
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));
        assert_eq!(store.save_count(), 1);

        store.delete().await.unwrap();
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_lock_is_refused() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("run-1", "a").await.unwrap();

        let err = store.acquire_lock("run-2", "b").await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::ConcurrentRun { .. })));

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.acquire_lock("run-2", "b").await.is_ok());
    }

    #[test]
    fn test_force_unlock_clears_foreign_lock() {
        let store = MemoryStateStore::new();
        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.acquire_lock("run-1", "a").await);
            tokio_test::assert_ok!(store.force_unlock().await);
            assert!(store.lock_info().await.unwrap().is_none());
        });
    }
}
