//! Coalescing refresh scheduler.
//!
//! The scheduler turns "please refresh this train" requests into refresh
//! passes with at most one pass per train in flight and at most one pass
//! queued behind it:
//!
//! ```text
//! request(A) ──► spawn run(A) ─► pass ─► rerun? ─► pass ─► idle
//! request(A) ──► dirty = true ─────────────┘
//! request(A) ──► dirty = true (coalesced)
//! ```
//!
//! After each completed pass a run goes again if any of these hold:
//!
//! - a request arrived while it was running (the dirty flag),
//! - another caller was blocked by the train lock (the lock's refresh signal),
//! - the pass filled its batch and cars left the train, so cars beyond the
//!   limit can move up.
//!
//! A pass that was itself blocked, or failed, ends the run: the current
//! holder of the lock will see the signal the blocked pass left behind.
//!
//! Different trains run concurrently, each in its own tokio task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::lock::ExclusiveLock;
use crate::refresh::{RefreshOutcome, TrainRefresher};
use crate::store::CarStore;
use crate::types::TrainKey;

use super::poll::PollConfig;

/// What happened to a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new run was started for the train.
    Spawned,
    /// A run is in flight; it will go once more when done.
    Coalesced,
    /// The scheduler is shutting down and ignored the request.
    ShuttingDown,
}

#[derive(Debug, Default)]
struct RunState {
    dirty: bool,
}

/// What a run does after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterPass {
    /// Go again. `signalled` is set if the pass consumed a refresh signal.
    Rerun { signalled: bool },
    /// Go again only if a request arrived meanwhile.
    Settle,
    /// End the run regardless of pending requests.
    Stop,
}

struct Inner<R, L> {
    refresher: Arc<R>,
    lock: Arc<L>,
    runs: Mutex<HashMap<TrainKey, RunState>>,
    idle: Notify,
    shutdown: CancellationToken,
}

/// Runs refresh passes for trains on request, coalescing duplicates.
pub struct RefreshScheduler<R, L> {
    inner: Arc<Inner<R, L>>,
}

impl<R, L> Clone for RefreshScheduler<R, L> {
    fn clone(&self) -> Self {
        RefreshScheduler {
            inner: self.inner.clone(),
        }
    }
}

impl<R, L> RefreshScheduler<R, L>
where
    R: TrainRefresher + 'static,
    L: ExclusiveLock + 'static,
{
    pub fn new(refresher: Arc<R>, lock: Arc<L>) -> Self {
        Self::new_with_shutdown(refresher, lock, CancellationToken::new())
    }

    /// Creates a scheduler that stops when `shutdown` is cancelled.
    pub fn new_with_shutdown(refresher: Arc<R>, lock: Arc<L>, shutdown: CancellationToken) -> Self {
        RefreshScheduler {
            inner: Arc::new(Inner {
                refresher,
                lock,
                runs: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Asks for `key` to be refreshed.
    #[instrument(skip_all, fields(train = %key))]
    pub async fn request(&self, key: TrainKey) -> RequestOutcome {
        if self.inner.shutdown.is_cancelled() {
            return RequestOutcome::ShuttingDown;
        }

        {
            let mut runs = self.inner.runs.lock().await;
            if let Some(state) = runs.get_mut(&key) {
                state.dirty = true;
                debug!("refresh already running, coalesced");
                return RequestOutcome::Coalesced;
            }
            runs.insert(key.clone(), RunState::default());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(key).await });
        RequestOutcome::Spawned
    }

    /// Returns true if a run for `key` is in flight.
    pub async fn is_running(&self, key: &TrainKey) -> bool {
        self.inner.runs.lock().await.contains_key(key)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.runs.lock().await.len()
    }

    /// Waits until no run is in flight.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.runs.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting requests and waits for in-flight passes to finish.
    ///
    /// Passes are never interrupted midway, so no lock is left to expire.
    /// A refresh signal consumed by a pass that will not rerun is recorded
    /// again for the next process to pick up.
    pub async fn shutdown(&self) {
        info!("shutting down refresh scheduler");
        self.inner.shutdown.cancel();
        self.drain().await;
    }

    /// Periodically requests a refresh of every active train until shutdown.
    ///
    /// Each train is first polled after [`PollConfig::initial_poll_delay`]
    /// and then every [`PollConfig::poll_interval_with_jitter`]. The list of
    /// active trains is re-read at least once per poll interval.
    pub async fn run_poller<S: CarStore>(&self, store: &S, config: &PollConfig) {
        info!(poll_interval = ?config.interval(), "poll fallback started");
        let mut due: HashMap<TrainKey, Instant> = HashMap::new();

        loop {
            let now = Instant::now();
            match store.active_trains().await {
                Ok(keys) => {
                    let active: HashSet<&TrainKey> = keys.iter().collect();
                    due.retain(|key, _| active.contains(key));

                    for key in &keys {
                        let at = *due
                            .entry(key.clone())
                            .or_insert_with(|| now + config.initial_poll_delay(key));
                        if at <= now {
                            self.request(key.clone()).await;
                            due.insert(key.clone(), now + config.poll_interval_with_jitter(key));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to list active trains"),
            }

            let rescan = now + config.interval();
            let next = due.values().min().copied().unwrap_or(rescan).min(rescan);
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        info!("poll fallback stopped");
    }
}

impl<R, L> Inner<R, L>
where
    R: TrainRefresher,
    L: ExclusiveLock,
{
    #[instrument(skip_all, fields(train = %key))]
    async fn run(self: Arc<Self>, key: TrainKey) {
        let mut passes = 0u32;
        loop {
            passes += 1;
            let after = self.pass(&key).await;
            let stopping = self.shutdown.is_cancelled();
            if stopping && after == (AfterPass::Rerun { signalled: true }) {
                self.restore_signal(&key).await;
            }

            let mut runs = self.runs.lock().await;
            let dirty = runs
                .get_mut(&key)
                .map(|state| std::mem::take(&mut state.dirty))
                .unwrap_or(false);

            let finished = match after {
                AfterPass::Rerun { .. } => false,
                AfterPass::Settle => !dirty,
                AfterPass::Stop => true,
            };
            if finished || stopping {
                runs.remove(&key);
                if runs.is_empty() {
                    self.idle.notify_waiters();
                }
                debug!(passes, "refresh run finished");
                return;
            }
            debug!(passes, dirty, "refreshing train again");
        }
    }

    async fn restore_signal(&self, key: &TrainKey) {
        match self.lock.mark_signal(key).await {
            Ok(_) => debug!("refresh signal kept for after shutdown"),
            Err(e) => warn!(error = %e, "failed to keep refresh signal"),
        }
    }

    async fn pass(&self, key: &TrainKey) -> AfterPass {
        let report = match self.refresher.refresh_train(key).await {
            Ok(RefreshOutcome::Completed(report)) => report,
            // The holder consumes the signal this pass left behind.
            Ok(RefreshOutcome::Blocked) => return AfterPass::Stop,
            Err(e) => {
                error!(error = %e, "refresh pass failed");
                return AfterPass::Stop;
            }
        };

        let signal = match self.lock.consume_signal(key).await {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to read refresh signal");
                false
            }
        };

        if signal {
            debug!("refresh was requested during the pass");
        }
        if signal || report.needs_requeue() {
            AfterPass::Rerun { signalled: signal }
        } else {
            AfterPass::Settle
        }
    }
}
