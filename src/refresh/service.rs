//! The per-train refresh coordinator.
//!
//! ```text
//! Idle ──try_acquire_or_signal──► Running ──► release ──► Done
//!   │                                │
//!   │ lock held                      └── fatal error: lease left to expire
//!   ▼
//! Blocked (refresh signal recorded)
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::RefreshConfig;
use crate::lock::{ExclusiveLock, ReleaseOutcome};
use crate::store::CarStore;
use crate::types::{CarId, MergeRequestId, ProjectId, TrainKey};

use super::{CarRefresher, RefreshContext, RefreshError, RefreshResult, TrainRefresher};

/// The result of one car within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarRefresh {
    pub car_id: CarId,
    pub merge_request_id: MergeRequestId,
    /// Whether the car was forced to recreate its pipeline.
    pub forced: bool,
    pub result: RefreshResult,
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub key: TrainKey,
    /// Per-car results in position order.
    pub cars: Vec<CarRefresh>,
    /// Number of cars read from the store.
    pub fetched: usize,
    /// The limit the cars were read with.
    pub limit: usize,
    pub release: ReleaseOutcome,
}

impl RefreshReport {
    /// The pass saw as many cars as it was allowed to, so more may be queued.
    pub fn batch_full(&self) -> bool {
        self.fetched >= self.limit
    }

    /// Cars beyond the limit can now move up and deserve a pass of their own.
    pub fn needs_requeue(&self) -> bool {
        self.batch_full() && self.cars.iter().any(|c| c.result.left_train())
    }

    pub fn merged(&self) -> usize {
        self.cars.iter().filter(|c| c.result.merged).count()
    }

    pub fn dropped(&self) -> usize {
        self.cars
            .iter()
            .filter(|c| c.result.status.is_error())
            .count()
    }

    pub fn pipelines_created(&self) -> usize {
        self.cars
            .iter()
            .filter(|c| c.result.pipeline_created)
            .count()
    }
}

/// How a call to [`RefreshService::execute`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another coordinator holds the train; a refresh signal was recorded so
    /// it runs once more after finishing.
    Blocked,
    Completed(RefreshReport),
}

impl RefreshOutcome {
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            RefreshOutcome::Blocked => None,
            RefreshOutcome::Completed(report) => Some(report),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, RefreshOutcome::Blocked)
    }
}

/// Serializes and runs refresh passes over a train.
pub struct RefreshService<L, S, F> {
    lock: Arc<L>,
    store: Arc<S>,
    refresher: F,
    config: RefreshConfig,
}

impl<L, S, F> RefreshService<L, S, F>
where
    L: ExclusiveLock,
    S: CarStore,
    F: CarRefresher,
{
    pub fn new(lock: Arc<L>, store: Arc<S>, refresher: F, config: RefreshConfig) -> Self {
        RefreshService {
            lock,
            store,
            refresher,
            config,
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn lock(&self) -> &Arc<L> {
        &self.lock
    }

    /// Runs one refresh pass over the train targeting `target_branch` of
    /// `target_project_id`.
    ///
    /// Returns [`RefreshOutcome::Blocked`] without waiting if another pass
    /// holds the train. On error the lock is not released and recovers via
    /// its TTL.
    pub async fn execute(
        &self,
        target_project_id: ProjectId,
        target_branch: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.run(&TrainKey::new(target_project_id, target_branch))
            .await
    }

    #[instrument(skip(self), fields(train = %key))]
    async fn run(&self, key: &TrainKey) -> Result<RefreshOutcome, RefreshError> {
        let Some(lease) = self
            .lock
            .try_acquire_or_signal(key, self.config.lock_ttl)
            .await?
        else {
            debug!("train is locked, refresh deferred to the holder");
            return Ok(RefreshOutcome::Blocked);
        };

        let limit = self.config.concurrency_limit;
        let train = self.store.all_cars(key, limit).await?;
        debug!(
            fencing_token = %lease.token,
            cars = train.len(),
            limit,
            "refreshing train"
        );

        let mut ctx = RefreshContext::first();
        let mut cars = Vec::with_capacity(train.len());
        for train_car in &train {
            if !self.lock.is_held(&lease).await? {
                warn!(
                    fencing_token = %lease.token,
                    car = %train_car.car.id,
                    "lock expired mid-pass, stopping"
                );
                return Err(RefreshError::LeaseLost {
                    key: key.clone(),
                    token: lease.token,
                });
            }

            let forced = ctx.require_recreate;
            let result = self.refresher.refresh(train_car, &ctx).await?;
            ctx = ctx.advance(&result);
            cars.push(CarRefresh {
                car_id: train_car.car.id,
                merge_request_id: train_car.merge_request.id,
                forced,
                result,
            });
        }

        let release = self.lock.release(&lease).await?;

        let report = RefreshReport {
            key: key.clone(),
            cars,
            fetched: train.len(),
            limit,
            release,
        };
        info!(
            fetched = report.fetched,
            merged = report.merged(),
            dropped = report.dropped(),
            pipelines_created = report.pipelines_created(),
            "refresh pass complete"
        );
        Ok(RefreshOutcome::Completed(report))
    }
}

impl<L, S, F> TrainRefresher for RefreshService<L, S, F>
where
    L: ExclusiveLock,
    S: CarStore,
    F: CarRefresher,
{
    async fn refresh_train(&self, key: &TrainKey) -> Result<RefreshOutcome, RefreshError> {
        self.run(key).await
    }
}
