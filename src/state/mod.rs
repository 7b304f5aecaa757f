//! State management module.
//!
//! This module provides persistent state storage for tracking applied
//! resources, their outputs and the run history, plus the run lock that keeps
//! two runs from applying the same stack at once.

mod store;
mod local;
mod s3;
mod memory;
mod lock;
mod session;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use memory::MemoryStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, generate_run_id};
pub use session::{LOCK_REFRESH_INTERVAL, RecordGuard, RecordLocks, RunSession};
pub use types::{MAX_HISTORY, RunHistoryEntry, RunOperation, STATE_VERSION, StackState, StateRecord};
