//! File-backed exclusive lock.
//!
//! Each train gets a handful of files in the lock directory, named from
//! [`TrainKey::file_stem`]:
//!
//! ```text
//! <stem>.lock    current holder record (JSON), absent when unlocked
//! <stem>.fence   last fencing token issued, survives release
//! <stem>.signal  present while a refresh signal is pending
//! <stem>.guard   advisory-locked while a mutation is in progress
//! ```
//!
//! Every read-check-write of `.lock`, `.fence` and `.signal` happens while
//! holding an exclusive advisory lock on `.guard`, so two processes sharing
//! the directory never interleave. The guard file itself is never deleted.
//! The kernel drops the advisory lock when its holder exits, so a crash
//! mid-mutation cannot wedge the train.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::types::TrainKey;

use super::fsync::{fsync_dir, write_atomic};
use super::{
    ExclusiveLock, FencingToken, LockError, LockLease, ReleaseOutcome, expiry_after, new_holder_id,
};

/// How long to keep retrying for a contended guard.
const GUARD_WAIT: Duration = Duration::from_secs(1);

/// Pause between guard attempts.
const GUARD_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// An [`ExclusiveLock`] backed by files in a shared directory.
///
/// Every process pointing at the same directory sees the same locks. Expiry
/// compares wall-clock timestamps, so hosts sharing a directory need
/// reasonably synchronized clocks.
#[derive(Clone)]
pub struct FileLock {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("dir", &self.dir).finish()
    }
}

impl FileLock {
    /// Opens (creating if needed) a lock directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, LockError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileLock { dir, clock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs blocking file work off the async runtime.
    async fn blocking<T, F>(&self, key: &TrainKey, f: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(KeyFiles) -> Result<T, LockError> + Send + 'static,
    {
        let files = KeyFiles::new(&self.dir, key);
        tokio::task::spawn_blocking(move || f(files)).await?
    }
}

// ─── On-disk records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    token: FencingToken,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn matches(&self, lease: &LockLease) -> bool {
        self.holder == lease.holder && self.token == lease.token
    }
}

/// Paths of the files belonging to one train.
struct KeyFiles {
    key: TrainKey,
    dir: PathBuf,
    lock: PathBuf,
    fence: PathBuf,
    signal: PathBuf,
    guard: PathBuf,
}

impl KeyFiles {
    fn new(dir: &Path, key: &TrainKey) -> Self {
        let stem = key.file_stem();
        KeyFiles {
            key: key.clone(),
            dir: dir.to_path_buf(),
            lock: dir.join(format!("{stem}.lock")),
            fence: dir.join(format!("{stem}.fence")),
            signal: dir.join(format!("{stem}.signal")),
            guard: dir.join(format!("{stem}.guard")),
        }
    }

    fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        let bytes = match std::fs::read(&self.lock) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| LockError::Corrupted {
                key: self.key.to_string(),
                source,
            })
    }

    fn read_fence(&self) -> Result<FencingToken, LockError> {
        let bytes = match std::fs::read(&self.fence) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FencingToken::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| LockError::Corrupted {
            key: self.key.to_string(),
            source,
        })
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), LockError> {
        let bytes = serde_json::to_vec(value).map_err(|source| LockError::Corrupted {
            key: self.key.to_string(),
            source,
        })?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Takes the mutation guard, waiting up to [`GUARD_WAIT`].
    fn guard(&self) -> Result<Guard, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard)?;

        let deadline = Instant::now() + GUARD_WAIT;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Guard { _file: file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(LockError::GuardTimeout(self.key.to_string()));
            }
            std::thread::sleep(GUARD_RETRY_INTERVAL);
        }
    }

    /// Takes the lock unless a non-expired record exists. Call under the guard.
    fn acquire(
        &self,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockLease>, LockError> {
        let current = self.read_record()?;
        if let Some(record) = &current {
            if record.expires_at > now {
                trace!(key = %self.key, holder = %record.holder, "lock held");
                return Ok(None);
            }
            debug!(
                key = %self.key,
                previous_holder = %record.holder,
                previous_token = %record.token,
                "taking over expired lock"
            );
        }

        let last = self.read_fence()?;
        let last = current.map_or(last, |record| last.max(record.token));
        let token = last.next();

        let record = LockRecord {
            holder: new_holder_id(now),
            token,
            acquired_at: now,
            expires_at,
        };
        self.write_json(&self.fence, &token)?;
        self.write_json(&self.lock, &record)?;

        debug!(key = %self.key, fencing_token = %token, "lock acquired");
        Ok(Some(LockLease {
            key: self.key.clone(),
            holder: record.holder,
            token,
            acquired_at: now,
            expires_at,
        }))
    }

    /// Creates the signal marker. Returns false if one was already pending.
    fn create_signal(&self) -> Result<bool, LockError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.signal)
        {
            Ok(_) => {
                fsync_dir(&self.dir)?;
                trace!(key = %self.key, "refresh signal recorded");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Holds the advisory lock on a guard file; closing the file releases it.
struct Guard {
    _file: File,
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ─── ExclusiveLock ────────────────────────────────────────────────────────────

impl ExclusiveLock for FileLock {
    async fn try_acquire(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;

        self.blocking(key, move |files| {
            let _guard = files.guard()?;
            files.acquire(now, expires_at)
        })
        .await
    }

    async fn try_acquire_or_signal(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;

        self.blocking(key, move |files| {
            let _guard = files.guard()?;
            let lease = files.acquire(now, expires_at)?;
            if lease.is_none() {
                files.create_signal()?;
            }
            Ok(lease)
        })
        .await
    }

    async fn release(&self, lease: &LockLease) -> Result<ReleaseOutcome, LockError> {
        let lease = lease.clone();
        self.blocking(&lease.key.clone(), move |files| {
            let _guard = files.guard()?;

            match files.read_record()? {
                Some(record) if record.matches(&lease) => {
                    remove_if_exists(&files.lock)?;
                    fsync_dir(&files.dir)?;
                    debug!(key = %files.key, fencing_token = %lease.token, "lock released");
                    Ok(ReleaseOutcome::Released)
                }
                _ => {
                    warn!(
                        key = %files.key,
                        fencing_token = %lease.token,
                        "lock release skipped: lease is no longer current"
                    );
                    Ok(ReleaseOutcome::Stale)
                }
            }
        })
        .await
    }

    async fn is_held(&self, lease: &LockLease) -> Result<bool, LockError> {
        let now = self.clock.now();
        let lease = lease.clone();
        // Records are replaced by rename, so an unguarded read sees a whole one.
        self.blocking(&lease.key.clone(), move |files| {
            Ok(files
                .read_record()?
                .is_some_and(|record| record.matches(&lease) && record.expires_at > now))
        })
        .await
    }

    async fn mark_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
        self.blocking(key, |files| files.create_signal()).await
    }

    async fn consume_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
        self.blocking(key, |files| Ok(remove_if_exists(&files.signal)?))
            .await
    }
}
