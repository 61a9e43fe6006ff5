//! Train refresh: re-validating the cars of a train in order.
//!
//! A refresh pass takes the train's exclusive lock, reads the first
//! `concurrency_limit` cars and asks the [`CarRefresher`] to evaluate each
//! one in position order. After every car the pass decides whether the next
//! car must get a new pipeline: once any car's outcome changes what its
//! successors were validated against (it was dropped, got a new pipeline,
//! or was merged), every car behind it is forced to recreate.
//!
//! ```text
//!  car 1: pipeline ok ──► car 2: dropped ──► car 3: forced ──► car 4: forced
//!         (no force)                (force)          (force)
//! ```
//!
//! # Modules
//!
//! - [`merge_request`]: the per-car refresher
//! - [`service`]: the per-train coordinator

pub mod merge_request;
pub mod service;


use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::gateway::MergeError;
use crate::lock::{FencingToken, LockError};
use crate::store::StoreError;
use crate::types::{DropReason, Sha, TrainCar, TrainKey};

pub use merge_request::MergeRequestRefresher;
pub use service::{CarRefresh, RefreshOutcome, RefreshReport, RefreshService};

/// Errors that abort a refresh pass.
///
/// Problems with an individual car are not errors: they drop the car and
/// are reported as [`RefreshStatus::Error`].
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to read head of {branch}: {source}")]
    BranchHead {
        branch: String,
        #[source]
        source: MergeError,
    },

    /// The lock expired and may have been taken over; the pass stopped
    /// before touching another car.
    #[error("lost the lock on {key} (fencing token {token})")]
    LeaseLost { key: TrainKey, token: FencingToken },
}

/// What the coordinator tells the refresher about the cars ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshContext {
    /// A car ahead changed, so any existing pipeline is out of date.
    pub require_recreate: bool,

    /// The train ref of the closest surviving car ahead, which this car's
    /// pipeline must be based on. `None` for the first car.
    pub previous_ref: Option<Sha>,

    /// No surviving car is ahead of this one.
    pub first_in_train: bool,
}

impl Default for RefreshContext {
    fn default() -> Self {
        Self::first()
    }
}

impl RefreshContext {
    /// Context for the car at the front of a pass.
    pub fn first() -> Self {
        RefreshContext {
            require_recreate: false,
            previous_ref: None,
            first_in_train: true,
        }
    }

    /// Context for the car following one that produced `result`.
    pub fn advance(self, result: &RefreshResult) -> Self {
        let require_recreate = result.forces_recreate();
        if result.merged {
            // The merged car is now part of the target branch.
            RefreshContext {
                require_recreate,
                previous_ref: None,
                first_in_train: self.first_in_train,
            }
        } else if result.status.is_error() {
            RefreshContext {
                require_recreate,
                ..self
            }
        } else {
            RefreshContext {
                require_recreate,
                previous_ref: result.train_ref.clone().or(self.previous_ref),
                first_in_train: false,
            }
        }
    }
}

/// Whether a car survived its refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStatus {
    Success,
    /// The car was dropped from the train.
    Error(DropReason),
}

impl RefreshStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, RefreshStatus::Error(_))
    }
}

/// The outcome of refreshing one car.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshResult {
    pub status: RefreshStatus,
    /// A new train pipeline was created for the car.
    pub pipeline_created: bool,
    /// The car was merged into the target branch.
    pub merged: bool,
    /// The train ref the car's pipeline validates, if it is still queued.
    pub train_ref: Option<Sha>,
}

impl RefreshResult {
    /// The car is unchanged and waits for its pipeline or its predecessors.
    pub fn waiting(train_ref: Option<Sha>) -> Self {
        RefreshResult {
            status: RefreshStatus::Success,
            pipeline_created: false,
            merged: false,
            train_ref,
        }
    }

    pub fn pipeline_created(train_ref: Sha) -> Self {
        RefreshResult {
            status: RefreshStatus::Success,
            pipeline_created: true,
            merged: false,
            train_ref: Some(train_ref),
        }
    }

    pub fn merged() -> Self {
        RefreshResult {
            status: RefreshStatus::Success,
            pipeline_created: false,
            merged: true,
            train_ref: None,
        }
    }

    pub fn dropped(reason: DropReason) -> Self {
        RefreshResult {
            status: RefreshStatus::Error(reason),
            pipeline_created: false,
            merged: false,
            train_ref: None,
        }
    }

    /// Returns true if every car behind this one must recreate its pipeline.
    pub fn forces_recreate(&self) -> bool {
        self.status.is_error() || self.pipeline_created || self.merged
    }

    /// Returns true if the car is no longer on the train.
    pub fn left_train(&self) -> bool {
        self.status.is_error() || self.merged
    }
}

/// Evaluates a single car.
pub trait CarRefresher: Send + Sync {
    /// Refreshes `car`, dropping, re-validating or merging it as needed.
    ///
    /// Returns `Err` only for failures that must abort the whole pass.
    fn refresh(
        &self,
        car: &TrainCar,
        ctx: &RefreshContext,
    ) -> impl Future<Output = Result<RefreshResult, RefreshError>> + Send;
}

impl<T: CarRefresher> CarRefresher for Arc<T> {
    fn refresh(
        &self,
        car: &TrainCar,
        ctx: &RefreshContext,
    ) -> impl Future<Output = Result<RefreshResult, RefreshError>> + Send {
        (**self).refresh(car, ctx)
    }
}

/// Runs refresh passes for whole trains.
pub trait TrainRefresher: Send + Sync {
    fn refresh_train(
        &self,
        key: &TrainKey,
    ) -> impl Future<Output = Result<RefreshOutcome, RefreshError>> + Send;
}
