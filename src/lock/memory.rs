//! Process-local exclusive lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::types::TrainKey;

use super::{
    ExclusiveLock, FencingToken, LockError, LockLease, ReleaseOutcome, expiry_after, new_holder_id,
};

#[derive(Debug, Default)]
struct KeyState {
    holder: Option<LockLease>,
    /// Survives release so tokens stay monotonic per key.
    last_token: FencingToken,
    signal: bool,
}

/// An [`ExclusiveLock`] held in process memory.
///
/// Suitable when every coordinator for a train runs in one process (for
/// example behind a single [`RefreshScheduler`](crate::worker::RefreshScheduler)).
pub struct MemoryLock {
    clock: Arc<dyn Clock>,
    keys: Mutex<HashMap<TrainKey, KeyState>>,
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryLock {
            clock,
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl KeyState {
    /// Takes the lock unless a non-expired holder exists.
    fn acquire(
        &mut self,
        key: &TrainKey,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<LockLease> {
        if let Some(current) = &self.holder {
            if current.expires_at > now {
                trace!(key = %key, holder = %current.holder, "lock held");
                return None;
            }
            debug!(
                key = %key,
                previous_holder = %current.holder,
                previous_token = %current.token,
                "taking over expired lock"
            );
        }

        let token = self.last_token.next();
        let lease = LockLease {
            key: key.clone(),
            holder: new_holder_id(now),
            token,
            acquired_at: now,
            expires_at,
        };
        self.last_token = token;
        self.holder = Some(lease.clone());

        debug!(key = %key, fencing_token = %token, "lock acquired");
        Some(lease)
    }
}

impl ExclusiveLock for MemoryLock {
    async fn try_acquire(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut keys = self.keys.lock().await;
        Ok(keys.entry(key.clone()).or_default().acquire(key, now, expires_at))
    }

    async fn try_acquire_or_signal(
        &self,
        key: &TrainKey,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.clone()).or_default();

        let lease = state.acquire(key, now, expires_at);
        if lease.is_none() {
            state.signal = true;
            trace!(key = %key, "refresh signal recorded");
        }
        Ok(lease)
    }

    async fn release(&self, lease: &LockLease) -> Result<ReleaseOutcome, LockError> {
        let mut keys = self.keys.lock().await;
        let Some(state) = keys.get_mut(&lease.key) else {
            return Ok(ReleaseOutcome::Stale);
        };

        match &state.holder {
            Some(current) if current.holder == lease.holder && current.token == lease.token => {
                state.holder = None;
                debug!(key = %lease.key, fencing_token = %lease.token, "lock released");
                Ok(ReleaseOutcome::Released)
            }
            _ => {
                warn!(
                    key = %lease.key,
                    fencing_token = %lease.token,
                    "lock release skipped: lease is no longer current"
                );
                Ok(ReleaseOutcome::Stale)
            }
        }
    }

    async fn is_held(&self, lease: &LockLease) -> Result<bool, LockError> {
        let now = self.clock.now();
        let keys = self.keys.lock().await;
        Ok(keys
            .get(&lease.key)
            .and_then(|state| state.holder.as_ref())
            .is_some_and(|current| {
                current.holder == lease.holder
                    && current.token == lease.token
                    && current.expires_at > now
            }))
    }

    async fn mark_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.clone()).or_default();
        let created = !state.signal;
        state.signal = true;
        Ok(created)
    }

    async fn consume_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
        let mut keys = self.keys.lock().await;
        Ok(keys
            .get_mut(key)
            .map(|state| std::mem::take(&mut state.signal))
            .unwrap_or(false))
    }
}
