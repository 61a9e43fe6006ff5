//! Refresh configuration.
//!
//! Settings that a coordinator needs are passed in explicitly at construction
//! rather than read from process-wide state.
//!
//! # Environment
//!
//! - `MERGE_TRAIN_CONCURRENCY_LIMIT`: cars processed per pass (default 20)
//! - `MERGE_TRAIN_LOCK_TTL_SECS`: lock time-to-live in seconds (default 900)

use std::time::Duration;

/// Default number of cars walked in a single refresh pass.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 20;

/// Default lock TTL (15 minutes).
const DEFAULT_LOCK_TTL_SECS: u64 = 15 * 60;

/// Configuration for a [`RefreshService`](crate::refresh::RefreshService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Maximum number of cars fetched and refreshed in one pass.
    ///
    /// Cars beyond the limit wait for a later pass.
    pub concurrency_limit: usize,

    /// How long an exclusive lock stays valid without being released.
    ///
    /// This is the only recovery path for a coordinator that crashed or hung
    /// while holding the lock.
    pub lock_ttl: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshConfig {
    pub fn new() -> Self {
        RefreshConfig {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }

    /// Creates a `RefreshConfig` from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults. A zero
    /// concurrency limit is treated as unset.
    pub fn from_env() -> Self {
        let concurrency_limit = std::env::var("MERGE_TRAIN_CONCURRENCY_LIMIT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY_LIMIT);

        let lock_ttl_secs = std::env::var("MERGE_TRAIN_LOCK_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_LOCK_TTL_SECS);

        RefreshConfig {
            concurrency_limit,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}
