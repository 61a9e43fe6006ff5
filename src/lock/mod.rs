//! Exclusive per-train locking with coalesced refresh signals.
//!
//! Only one coordinator may walk a train at a time. Acquisition never blocks:
//! a caller that finds the lock held records a *refresh signal* and returns,
//! and the holder consumes that signal after releasing so exactly one
//! follow-up refresh runs.
//!
//! Finding the lock held and recording the signal happen in one step
//! ([`ExclusiveLock::try_acquire_or_signal`]). Were they separate, the holder
//! could release and look for a signal in between, and the request would be
//! lost.
//!
//! # Fencing
//!
//! Locks expire after a TTL so a crashed holder cannot wedge its train. When
//! an expired lock is taken over, the new lease gets a strictly greater
//! [`FencingToken`]. Release only deletes the record if the caller's token
//! is still current, and [`ExclusiveLock::is_held`] lets a long-running
//! holder notice it has been superseded before its next write.
//!
//! # Implementations
//!
//! - [`MemoryLock`]: process-local, for a single scheduler process and tests
//! - [`FileLock`]: lock files in a shared directory, usable across processes

mod file;
mod fsync;
mod memory;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TrainKey;

pub use file::FileLock;
pub use memory::MemoryLock;

/// Errors from the lock backend.
///
/// Contention is not an error: it is reported as `Ok(None)` from
/// [`ExclusiveLock::try_acquire`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted lock record for {key}: {source}")]
    Corrupted {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock TTL out of range: {0:?}")]
    InvalidTtl(Duration),

    #[error("timed out waiting for the lock guard of {0}")]
    GuardTimeout(String),

    #[error("lock task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Monotonically increasing per-key acquisition counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FencingToken(pub u64);

impl FencingToken {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> FencingToken {
        FencingToken(self.0 + 1)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of holding a train's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: TrainKey,
    /// Unique to this acquisition attempt.
    pub holder: String,
    pub token: FencingToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock record was ours and has been deleted.
    Released,

    /// The lease expired and the lock is gone or belongs to someone else.
    /// Nothing was deleted.
    Stale,
}

/// A non-blocking, TTL-bounded mutual exclusion primitive keyed by train.
pub trait ExclusiveLock: Send + Sync {
    /// Attempts to take the lock for `key`.
    ///
    /// Returns `Ok(None)` without waiting if a non-expired lock exists.
    fn try_acquire(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<LockLease>, LockError>> + Send;

    /// Attempts to take the lock for `key`, recording a refresh signal in
    /// the same critical section if a non-expired lock exists.
    ///
    /// A holder that releases after this returns `Ok(None)` is guaranteed to
    /// see the signal.
    fn try_acquire_or_signal(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<LockLease>, LockError>> + Send;

    /// Deletes the lock record if `lease` is still the current holder.
    fn release(
        &self,
        lease: &LockLease,
    ) -> impl Future<Output = Result<ReleaseOutcome, LockError>> + Send;

    /// Returns true if `lease` is the current, unexpired holder.
    fn is_held(&self, lease: &LockLease) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Records a pending refresh for `key` regardless of the lock state.
    ///
    /// Returns true if this call created the signal, false if one was
    /// already pending.
    fn mark_signal(&self, key: &TrainKey) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Reads and clears the pending signal for `key`.
    fn consume_signal(
        &self,
        key: &TrainKey,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a holder identity unique to this process and attempt.
pub(crate) fn new_holder_id(now: DateTime<Utc>) -> String {
    let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{}",
        std::process::id(),
        now.timestamp_nanos_opt().unwrap_or_default(),
        seq
    )
}

/// Computes when a lock taken at `now` with `ttl` expires.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, LockError> {
    chrono::TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(LockError::InvalidTtl(ttl))
}
