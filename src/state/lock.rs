//! Run locking.
//!
//! Only one run may apply a stack at a time. The lock records which run holds
//! it and expires after five minutes unless refreshed, so a crashed run does
//! not block the stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Run holding the lock.
    pub run_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(run_id: &str, holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// The error reported to a run that finds this lock held.
    #[must_use]
    pub fn conflict(&self) -> StateError {
        StateError::ConcurrentRun {
            run_id: self.run_id.clone(),
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// The error reported when a lock exists but cannot be read, as when its
/// holder is still writing it.
pub(super) fn unreadable_conflict() -> StateError {
    StateError::ConcurrentRun {
        run_id: String::from("unknown"),
        holder: String::from("unknown"),
        since: String::from("unknown"),
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

/// Generates a new run identifier.
#[must_use]
pub fn generate_run_id() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

/// Resolves the holder to record: the given one, or a generated one.
pub(super) fn holder_or_generated(holder: &str) -> String {
    if holder.is_empty() {
        generate_holder_id()
    } else {
        holder.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("run-1", "test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert_eq!(lock.run_id, "run-1");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_lock_refresh() {
        let mut lock = LockInfo::new("run-1", "test-holder");
        let original_expiry = lock.expires_at;

        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.refresh();

        assert!(lock.expires_at >= original_expiry);
    }

    #[test]
    fn test_conflict_names_the_active_run() {
        let lock = LockInfo::new("run-7", "host-1-abc");
        match lock.conflict() {
            StateError::ConcurrentRun { run_id, holder, .. } => {
                assert_eq!(run_id, "run-7");
                assert_eq!(holder, "host-1-abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
