//! Tests for the refresh scheduler.
//!
//! Most tests drive the scheduler with a [`CountingTrains`] fake so the
//! number of passes per train can be asserted exactly. The `end_to_end`
//! module wires in the real coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RefreshConfig;
use crate::lock::{ExclusiveLock, MemoryLock, ReleaseOutcome};
use crate::refresh::{
    CarRefresh, MergeRequestRefresher, RefreshError, RefreshOutcome, RefreshReport,
    RefreshResult, RefreshService, TrainRefresher,
};
use crate::store::{MemoryCarStore, StoreError};
use crate::test_utils::{FakeForge, TrainFixture, init_tracing};
use crate::types::{CarId, MergeRequestId, PipelineStatus, TrainKey};

use super::{PollConfig, RefreshScheduler, RequestOutcome};

// ─── Test Helpers ───

/// What [`CountingTrains`] returns for a pass.
#[derive(Debug, Clone)]
enum Scripted {
    Quiet,
    /// A full batch in which the front car merged.
    FullBatchWithMerge,
    Blocked,
    Fail,
}

/// A [`TrainRefresher`] that counts passes and can leave a refresh signal
/// behind, as a caller blocked on the lock would.
struct CountingTrains {
    lock: Arc<MemoryLock>,
    delay: Duration,
    passes: Mutex<HashMap<TrainKey, usize>>,
    script: Mutex<HashMap<TrainKey, VecDeque<Scripted>>>,
    /// Keys to raise a refresh signal for during their next pass.
    signal_during: Mutex<Vec<TrainKey>>,
}

impl CountingTrains {
    fn new(lock: Arc<MemoryLock>) -> Self {
        CountingTrains {
            lock,
            delay: Duration::from_millis(0),
            passes: Mutex::new(HashMap::new()),
            script: Mutex::new(HashMap::new()),
            signal_during: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn script(&self, key: &TrainKey, passes: impl IntoIterator<Item = Scripted>) {
        self.script
            .lock()
            .await
            .insert(key.clone(), passes.into_iter().collect());
    }

    async fn signal_during_next_pass(&self, key: &TrainKey) {
        self.signal_during.lock().await.push(key.clone());
    }

    async fn passes(&self, key: &TrainKey) -> usize {
        self.passes.lock().await.get(key).copied().unwrap_or(0)
    }
}

fn report(key: &TrainKey, fetched: usize, limit: usize, merged_front: bool) -> RefreshReport {
    let cars = (1..=fetched as u64)
        .map(|id| CarRefresh {
            car_id: CarId(id),
            merge_request_id: MergeRequestId(id),
            forced: false,
            result: if merged_front && id == 1 {
                RefreshResult::merged()
            } else {
                RefreshResult::waiting(None)
            },
        })
        .collect();
    RefreshReport {
        key: key.clone(),
        cars,
        fetched,
        limit,
        release: ReleaseOutcome::Released,
    }
}

impl TrainRefresher for CountingTrains {
    async fn refresh_train(&self, key: &TrainKey) -> Result<RefreshOutcome, RefreshError> {
        *self.passes.lock().await.entry(key.clone()).or_default() += 1;

        let raise = {
            let mut pending = self.signal_during.lock().await;
            let before = pending.len();
            pending.retain(|k| k != key);
            pending.len() != before
        };
        if raise {
            self.lock.mark_signal(key).await?;
        }

        tokio::time::sleep(self.delay).await;

        let next = self
            .script
            .lock()
            .await
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Scripted::Quiet);
        match next {
            Scripted::Quiet => Ok(RefreshOutcome::Completed(report(key, 1, 20, false))),
            Scripted::FullBatchWithMerge => {
                Ok(RefreshOutcome::Completed(report(key, 3, 3, true)))
            }
            Scripted::Blocked => {
                self.lock.mark_signal(key).await?;
                Ok(RefreshOutcome::Blocked)
            }
            Scripted::Fail => Err(RefreshError::Store(StoreError::Backend(
                "connection reset".to_string(),
            ))),
        }
    }
}

type Scheduler = RefreshScheduler<CountingTrains, MemoryLock>;

fn setup(delay: Duration) -> (Scheduler, Arc<CountingTrains>, Arc<MemoryLock>) {
    let lock = Arc::new(MemoryLock::new());
    let trains = Arc::new(CountingTrains::new(lock.clone()).with_delay(delay));
    (RefreshScheduler::new(trains.clone(), lock.clone()), trains, lock)
}

fn main_train() -> TrainKey {
    TrainKey::new(1, "main")
}

// ─── Coalescing ───

mod coalescing {
    use super::*;

    #[tokio::test]
    async fn single_request_runs_one_pass() {
        init_tracing();
        let (scheduler, trains, _) = setup(Duration::ZERO);

        assert_eq!(scheduler.request(main_train()).await, RequestOutcome::Spawned);
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 1);
        assert!(!scheduler.is_running(&main_train()).await);
    }

    #[tokio::test]
    async fn requests_during_a_run_coalesce_into_one_rerun() {
        let (scheduler, trains, _) = setup(Duration::from_millis(50));

        assert_eq!(scheduler.request(main_train()).await, RequestOutcome::Spawned);
        for _ in 0..5 {
            assert_eq!(scheduler.request(main_train()).await, RequestOutcome::Coalesced);
        }
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 2);
    }

    #[tokio::test]
    async fn request_after_idle_starts_a_new_run() {
        let (scheduler, trains, _) = setup(Duration::ZERO);

        scheduler.request(main_train()).await;
        scheduler.drain().await;
        assert_eq!(scheduler.request(main_train()).await, RequestOutcome::Spawned);
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 2);
    }

    #[tokio::test]
    async fn trains_run_independently() {
        let (scheduler, trains, _) = setup(Duration::from_millis(20));
        let develop = TrainKey::new(1, "develop");

        assert_eq!(scheduler.request(main_train()).await, RequestOutcome::Spawned);
        assert_eq!(scheduler.request(develop.clone()).await, RequestOutcome::Spawned);
        assert_eq!(scheduler.running_count().await, 2);
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 1);
        assert_eq!(trains.passes(&develop).await, 1);
    }
}

// ─── Reruns ───

mod reruns {
    use super::*;

    #[tokio::test]
    async fn signal_raised_during_pass_causes_exactly_one_rerun() {
        let (scheduler, trains, lock) = setup(Duration::ZERO);
        trains.signal_during_next_pass(&main_train()).await;

        scheduler.request(main_train()).await;
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 2);
        assert!(!lock.consume_signal(&main_train()).await.unwrap());
    }

    #[tokio::test]
    async fn full_batch_that_lost_cars_is_requeued_once() {
        let (scheduler, trains, _) = setup(Duration::ZERO);
        trains
            .script(&main_train(), [Scripted::FullBatchWithMerge, Scripted::Quiet])
            .await;

        scheduler.request(main_train()).await;
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 2);
    }

    #[tokio::test]
    async fn blocked_pass_ends_run_and_keeps_signal_for_holder() {
        let (scheduler, trains, lock) = setup(Duration::ZERO);
        trains.script(&main_train(), [Scripted::Blocked]).await;

        scheduler.request(main_train()).await;
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 1);
        assert!(lock.consume_signal(&main_train()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_pass_ends_run() {
        let (scheduler, trains, _) = setup(Duration::ZERO);
        trains.script(&main_train(), [Scripted::Fail]).await;

        scheduler.request(main_train()).await;
        scheduler.drain().await;

        assert_eq!(trains.passes(&main_train()).await, 1);
        assert!(!scheduler.is_running(&main_train()).await);
    }
}

// ─── Shutdown ───

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_pass() {
        let (scheduler, trains, _) = setup(Duration::from_millis(30));

        scheduler.request(main_train()).await;
        scheduler.request(main_train()).await;
        scheduler.shutdown().await;

        // The pending rerun is abandoned once shutdown starts.
        assert_eq!(trains.passes(&main_train()).await, 1);
        assert_eq!(scheduler.running_count().await, 0);
    }

    #[tokio::test]
    async fn signal_consumed_before_shutdown_is_kept() {
        let (scheduler, trains, lock) = setup(Duration::from_millis(50));
        trains.signal_during_next_pass(&main_train()).await;

        scheduler.request(main_train()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.shutdown().await;

        assert_eq!(trains.passes(&main_train()).await, 1);
        assert!(lock.consume_signal(&main_train()).await.unwrap());
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_ignored() {
        let (scheduler, trains, _) = setup(Duration::ZERO);

        scheduler.shutdown().await;

        assert_eq!(
            scheduler.request(main_train()).await,
            RequestOutcome::ShuttingDown
        );
        assert_eq!(trains.passes(&main_train()).await, 0);
    }

    #[tokio::test]
    async fn external_token_stops_scheduler() {
        let lock = Arc::new(MemoryLock::new());
        let trains = Arc::new(CountingTrains::new(lock.clone()));
        let token = CancellationToken::new();
        let scheduler = RefreshScheduler::new_with_shutdown(trains, lock, token.clone());

        token.cancel();

        assert_eq!(
            scheduler.request(main_train()).await,
            RequestOutcome::ShuttingDown
        );
    }
}

// ─── Contention ───

mod contention {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::lock::{LockError, LockLease};
    use crate::test_utils::ScriptedRefresher;

    /// Delegates to a [`MemoryLock`], but holds back a blocked
    /// `try_acquire_or_signal` from returning until [`resume`](Self::resume).
    #[derive(Default)]
    struct StallingLock {
        inner: MemoryLock,
        stalled: AtomicUsize,
        resume: Notify,
    }

    impl StallingLock {
        fn stalled(&self) -> usize {
            self.stalled.load(Ordering::SeqCst)
        }

        fn resume(&self) {
            self.resume.notify_one();
        }
    }

    impl ExclusiveLock for StallingLock {
        async fn try_acquire(
            &self,
            key: &TrainKey,
            ttl: Duration,
        ) -> Result<Option<LockLease>, LockError> {
            self.inner.try_acquire(key, ttl).await
        }

        async fn try_acquire_or_signal(
            &self,
            key: &TrainKey,
            ttl: Duration,
        ) -> Result<Option<LockLease>, LockError> {
            let lease = self.inner.try_acquire_or_signal(key, ttl).await?;
            if lease.is_none() {
                self.stalled.fetch_add(1, Ordering::SeqCst);
                self.resume.notified().await;
            }
            Ok(lease)
        }

        async fn release(&self, lease: &LockLease) -> Result<ReleaseOutcome, LockError> {
            self.inner.release(lease).await
        }

        async fn is_held(&self, lease: &LockLease) -> Result<bool, LockError> {
            self.inner.is_held(lease).await
        }

        async fn mark_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
            self.inner.mark_signal(key).await
        }

        async fn consume_signal(&self, key: &TrainKey) -> Result<bool, LockError> {
            self.inner.consume_signal(key).await
        }
    }

    type Service = RefreshService<StallingLock, MemoryCarStore, Arc<ScriptedRefresher>>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn blocked_caller_finishing_after_holder_still_gets_a_rerun() {
        init_tracing();
        let fx = TrainFixture::new();
        fx.add_car(1).await;
        let lock = Arc::new(StallingLock::default());
        let refresher = Arc::new(ScriptedRefresher::new().with_delay(Duration::from_millis(100)));
        let service: Arc<Service> = Arc::new(RefreshService::new(
            lock.clone(),
            fx.store.clone(),
            refresher.clone(),
            RefreshConfig::new(),
        ));
        let scheduler = RefreshScheduler::new(service.clone(), lock.clone());

        assert_eq!(scheduler.request(fx.key.clone()).await, RequestOutcome::Spawned);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let contender = {
            let service = service.clone();
            let key = fx.key.clone();
            tokio::spawn(async move {
                service
                    .execute(key.target_project_id, &key.target_branch)
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while lock.stalled() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The holder finishes, including its signal check, before the
        // contender reports back.
        scheduler.drain().await;
        lock.resume();
        let outcome = contender.await.unwrap().unwrap();

        assert!(outcome.is_blocked());
        assert_eq!(refresher.calls().await.len(), 2);
        assert!(!lock.consume_signal(&fx.key).await.unwrap());
        assert!(!scheduler.is_running(&fx.key).await);
    }
}

// ─── Poll fallback ───

mod poller {
    use super::*;

    #[tokio::test]
    async fn poller_refreshes_active_trains_until_shutdown() {
        let fx = TrainFixture::new();
        fx.add_car(1).await;
        let (scheduler, trains, _) = setup(Duration::ZERO);
        let config = PollConfig::new()
            .with_poll_interval(Duration::from_millis(40))
            .with_jitter_percent(0);

        let poller = {
            let scheduler = scheduler.clone();
            let store = fx.store.clone();
            tokio::spawn(async move { scheduler.run_poller(store.as_ref(), &config).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap();

        assert!(trains.passes(&fx.key).await >= 2);
        assert_eq!(trains.passes(&TrainKey::new(1, "develop")).await, 0);
    }
}

// ─── End to end ───

mod end_to_end {
    use super::*;

    type Service = RefreshService<
        MemoryLock,
        MemoryCarStore,
        MergeRequestRefresher<MemoryCarStore, FakeForge, FakeForge>,
    >;

    #[tokio::test]
    async fn scheduled_refresh_creates_pipelines_for_the_train() {
        init_tracing();
        let fx = TrainFixture::new();
        fx.add_car(1).await;
        fx.add_car(2).await;
        let lock = Arc::new(MemoryLock::new());
        let service: Arc<Service> = Arc::new(RefreshService::new(
            lock.clone(),
            fx.store.clone(),
            MergeRequestRefresher::new(fx.store.clone(), fx.forge.clone(), fx.forge.clone()),
            RefreshConfig::new(),
        ));
        let scheduler = RefreshScheduler::new(service, lock.clone());

        scheduler.request(fx.key.clone()).await;
        scheduler.drain().await;

        assert_eq!(fx.forge.created().await.len(), 2);
        assert!(
            lock.try_acquire(&fx.key, Duration::from_secs(60))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn long_train_is_fully_refreshed_through_requeue() {
        let fx = TrainFixture::new();
        for id in 1..=5 {
            fx.add_car(id).await;
        }
        let lock = Arc::new(MemoryLock::new());
        let service: Arc<Service> = Arc::new(RefreshService::new(
            lock.clone(),
            fx.store.clone(),
            MergeRequestRefresher::new(fx.store.clone(), fx.forge.clone(), fx.forge.clone()),
            RefreshConfig::new().with_concurrency_limit(3),
        ));
        let scheduler = RefreshScheduler::new(service, lock);

        scheduler.request(fx.key.clone()).await;
        scheduler.drain().await;
        fx.finish_pipelines(PipelineStatus::Success).await;
        scheduler.request(fx.key.clone()).await;
        scheduler.drain().await;

        // The merge of car 1 frees a slot, so the requeued pass reaches car 4.
        assert_eq!(fx.forge.merged().await, vec![MergeRequestId(1)]);
        let car4 = fx.store.car(CarId(4)).await.unwrap();
        assert!(car4.pipeline_id.is_some());
        assert_eq!(fx.store.car(CarId(5)).await.unwrap().pipeline_id, None);
    }
}
