//! State locking for concurrent run protection.
//!
//! A lock record names the owning run and the host process holding it.
//! Locks expire so that a crashed run does not block the store forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Run that owns the lock.
    pub run_id: String,
    /// Host process holding the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock record for a run.
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            holder: generate_holder_id(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Sets the expiry to `ttl` after acquisition.
    #[must_use]
    pub fn expiring_in(mut self, ttl: chrono::Duration) -> Self {
        self.expires_at = self.acquired_at + ttl;
        self
    }

    /// Returns true if `run_id` owns this lock.
    #[must_use]
    pub fn is_owned_by(&self, run_id: &str) -> bool {
        self.run_id == run_id
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.extend(chrono::Duration::seconds(LOCK_EXPIRY_SECS));
    }

    /// Moves the expiry to `ttl` from now.
    pub fn extend(&mut self, ttl: chrono::Duration) {
        self.expires_at = Utc::now() + ttl;
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Generates a new run identifier such as `run-20240501T120000-1a2b3c4d`.
///
/// Identifiers sort by start time.
#[must_use]
pub fn generate_run_id() -> String {
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%S"))
}
