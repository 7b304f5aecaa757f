//! Run sessions.
//!
//! A [`RunSession`] is the explicit context of one run: it holds the run
//! lock, the cancellation token, the cached state document and the
//! per-resource record locks. Every record write goes through it, and it is
//! torn down on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LockInfo, generate_holder_id, generate_run_id};
use super::store::StateStore;
use super::types::{RunHistoryEntry, StackState, StateRecord};

/// How often the run lock is refreshed while a run is active.
pub const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Hands out one async mutex per resource name.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Proof that the holder has exclusive access to one resource's record.
#[derive(Debug)]
pub struct RecordGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl RecordLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the record of `name`.
    pub async fn lock(&self, name: &str) -> RecordGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };

        RecordGuard {
            name: name.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }
}

impl RecordGuard {
    /// Name of the locked record.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Keeps the run lock alive and remembers once it is gone.
struct LockKeeper {
    store: Arc<dyn StateStore>,
    lock_id: String,
    run: CancellationToken,
    lost: AtomicBool,
}

impl LockKeeper {
    /// Refreshes the lock. On failure the lock counts as lost for the rest of
    /// the run and the run is cancelled.
    async fn refresh(&self) -> Result<()> {
        if let Err(e) = self.store.refresh_lock(&self.lock_id).await {
            error!("Run lock {} lost ({e}), cancelling the run", self.lock_id);
            self.lost.store(true, Ordering::SeqCst);
            self.run.cancel();
            return Err(e);
        }
        debug!("Refreshed run lock {}", self.lock_id);
        Ok(())
    }

    fn ensure_held(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(ConvergeError::State(StateError::LockLost {
                lock_id: self.lock_id.clone(),
            }));
        }
        Ok(())
    }
}

/// The explicit context of one run.
pub struct RunSession {
    run_id: String,
    store: Arc<dyn StateStore>,
    lock: LockInfo,
    keeper: Arc<LockKeeper>,
    document: Mutex<StackState>,
    records: RecordLocks,
    cancellation: CancellationToken,
    heartbeat: CancellationToken,
    released: AtomicBool,
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("run_id", &self.run_id)
            .field("backend", &self.store.backend_type())
            .field("lock_id", &self.lock.lock_id)
            .finish_non_exhaustive()
    }
}

impl RunSession {
    /// Starts a run: takes the run lock and loads the state document.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ConcurrentRun` if another run holds the lock, or
    /// any error from loading state (the lock is released in that case).
    pub async fn start(
        store: Arc<dyn StateStore>,
        project: &str,
        environment: &str,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let run_id = generate_run_id();
        let lock = store.acquire_lock(&run_id, &generate_holder_id()).await?;

        let document = match store.load().await {
            Ok(Some(state)) => {
                if state.project != project || state.environment != environment {
                    warn!(
                        "State belongs to {}/{} but the stack is {project}/{environment}",
                        state.project, state.environment
                    );
                }
                state
            }
            Ok(None) => StackState::new(project, environment),
            Err(e) => {
                if let Err(release_err) = store.release_lock(&lock.lock_id).await {
                    warn!("Failed to release lock after load error: {release_err}");
                }
                return Err(e);
            }
        };

        let keeper = Arc::new(LockKeeper {
            store: Arc::clone(&store),
            lock_id: lock.lock_id.clone(),
            run: cancellation.clone(),
            lost: AtomicBool::new(false),
        });
        let heartbeat = CancellationToken::new();
        spawn_heartbeat(Arc::clone(&keeper), heartbeat.clone());

        info!("Started {run_id} on {} state", store.backend_type());

        Ok(Self {
            run_id,
            store,
            lock,
            keeper,
            document: Mutex::new(document),
            records: RecordLocks::new(),
            cancellation,
            heartbeat,
            released: AtomicBool::new(false),
        })
    }

    /// The run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run lock.
    #[must_use]
    pub const fn lock(&self) -> &LockInfo {
        &self.lock
    }

    /// The run-level cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true once the run lock could not be refreshed.
    #[must_use]
    pub fn lock_lost(&self) -> bool {
        self.keeper.lost.load(Ordering::SeqCst)
    }

    /// Refreshes the run lock now, outside the heartbeat schedule.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the lock is no longer ours. The run is
    /// cancelled and every later write is refused.
    pub async fn refresh_lock(&self) -> Result<()> {
        self.keeper.refresh().await
    }

    /// The per-resource record locks.
    #[must_use]
    pub const fn record_locks(&self) -> &RecordLocks {
        &self.records
    }

    /// Returns a copy of the current state document.
    pub async fn snapshot(&self) -> StackState {
        self.document.lock().await.clone()
    }

    /// Persists a record. The caller must hold the record's lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the guard is for another record or the write fails;
    /// the cached document is left unchanged in that case.
    pub async fn save_record(&self, guard: &RecordGuard, record: StateRecord) -> Result<()> {
        check_guard(guard, &record.id.name)?;
        let name = record.id.name.clone();
        self.update(|state| state.set_record(record)).await?;
        debug!("Persisted record for {name}");
        Ok(())
    }

    /// Removes a record. The caller must hold the record's lock.
    ///
    /// # Errors
    ///
    /// See [`RunSession::save_record`].
    pub async fn delete_record(&self, guard: &RecordGuard, name: &str) -> Result<()> {
        check_guard(guard, name)?;
        self.update(|state| {
            state.remove_record(name);
        })
        .await?;
        debug!("Removed record for {name}");
        Ok(())
    }

    /// Appends a run history entry and records the stack hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_run(&self, entry: RunHistoryEntry) -> Result<()> {
        self.update(|state| {
            if entry.success {
                state.stack_hash.clone_from(&entry.stack_hash);
            }
            state.add_history(entry);
        })
        .await
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StackState),
    {
        let mut document = self.document.lock().await;
        self.keeper.ensure_held()?;
        let mut next = document.clone();
        mutate(&mut next);
        self.store.save(&next).await?;
        *document = next;
        Ok(())
    }

    /// Ends the run and releases the lock. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be released.
    pub async fn close(&self) -> Result<()> {
        self.heartbeat.cancel();
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.release_lock(&self.lock.lock_id).await?;
        info!("Closed {}", self.run_id);
        Ok(())
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("{} dropped without close, releasing lock in background", self.run_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let lock_id = self.lock.lock_id.clone();
            handle.spawn(async move {
                if let Err(e) = store.release_lock(&lock_id).await {
                    warn!("Failed to release lock {lock_id}: {e}");
                }
            });
        }
    }
}

fn check_guard(guard: &RecordGuard, name: &str) -> Result<()> {
    if guard.name() == name {
        Ok(())
    } else {
        Err(ConvergeError::internal(format!(
            "record lock for '{}' used to write '{name}'",
            guard.name()
        )))
    }
}

fn spawn_heartbeat(keeper: Arc<LockKeeper>, stop: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(LOCK_REFRESH_INTERVAL) => {
                    if keeper.refresh().await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Outputs, ResourceId};
    use crate::state::{MemoryStateStore, RunOperation};
    use std::collections::BTreeMap;

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            ResourceId::new(name, "t"),
            Outputs::new(format!("{name}-id")),
            BTreeMap::new(),
            vec![],
            String::from("h"),
        )
    }

    async fn start(store: &Arc<MemoryStateStore>) -> Result<RunSession> {
        RunSession::start(
            Arc::clone(store) as Arc<dyn StateStore>,
            "app",
            "dev",
            CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_records_are_written_through() {
        let store = Arc::new(MemoryStateStore::new());
        let session = start(&store).await.unwrap();

        let guard = session.record_locks().lock("table").await;
        session.save_record(&guard, record("table")).await.unwrap();
        drop(guard);

        let persisted = store.load().await.unwrap().unwrap();
        assert!(persisted.get("table").is_some());

        let guard = session.record_locks().lock("table").await;
        session.delete_record(&guard, "table").await.unwrap();
        assert!(store.load().await.unwrap().unwrap().is_empty());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_guard_is_rejected() {
        let store = Arc::new(MemoryStateStore::new());
        let session = start(&store).await.unwrap();

        let guard = session.record_locks().lock("a").await;
        assert!(session.save_record(&guard, record("b")).await.is_err());
        assert_eq!(store.save_count(), 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_session_is_refused() {
        let store = Arc::new(MemoryStateStore::new());
        let first = start(&store).await.unwrap();

        let err = start(&store).await.unwrap_err();
        match err {
            ConvergeError::State(StateError::ConcurrentRun { run_id, .. }) => {
                assert_eq!(run_id, first.run_id());
            }
            other => panic!("unexpected error: {other}"),
        }

        first.close().await.unwrap();
        let second = start(&store).await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases() {
        let store = Arc::new(MemoryStateStore::new());
        let session = start(&store).await.unwrap();
        assert!(store.is_locked().await.unwrap());

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_record_run_sets_hash_on_success() {
        let store = Arc::new(MemoryStateStore::new());
        let session = start(&store).await.unwrap();

        let entry = RunHistoryEntry::new(session.run_id(), RunOperation::Apply, "abc", vec![]);
        session.record_run(entry).await.unwrap();

        let failed = RunHistoryEntry::new(session.run_id(), RunOperation::Apply, "def", vec![])
            .failed("boom");
        session.record_run(failed).await.unwrap();

        let state = session.snapshot().await;
        assert_eq!(state.stack_hash, "abc");
        assert_eq!(state.history.len(), 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lock_cancels_run_and_refuses_writes() {
        let store = Arc::new(MemoryStateStore::new());
        let session = start(&store).await.unwrap();
        let guard = session.record_locks().lock("table").await;
        session.save_record(&guard, record("table")).await.unwrap();

        // Someone force-unlocks and another run takes over.
        store.force_unlock().await.unwrap();
        let other = start(&store).await.unwrap();

        assert!(session.refresh_lock().await.is_err());
        assert!(session.lock_lost());
        assert!(session.cancellation().is_cancelled());

        let err = session.save_record(&guard, record("table")).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
        let entry = RunHistoryEntry::new(session.run_id(), RunOperation::Apply, "abc", vec![]);
        assert!(session.record_run(entry).await.is_err());
        assert_eq!(store.save_count(), 1);

        // Closing the stale session leaves the new holder's lock alone.
        drop(guard);
        session.close().await.unwrap();
        assert!(store.is_locked().await.unwrap());
        other.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_locks_serialize_same_name() {
        let locks = Arc::new(RecordLocks::new());
        let guard = locks.lock("x").await;

        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move { other.lock("x").await.name().to_string() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different name is not blocked.
        let _y = locks.lock("y").await;

        drop(guard);
        assert_eq!(waiter.await.unwrap(), "x");
    }
}
