//! Train membership storage.
//!
//! A train is never stored as such: it is the set of cars sharing a
//! [`TrainKey`], ordered by [`Car::position`]. The store is the only surface
//! through which train membership changes.

mod memory;

use std::future::Future;

use thiserror::Error;

use crate::types::{Car, CarId, MergeRequestId, PipelineId, RemovalReason, TrainCar, TrainKey, UserId};

pub use memory::MemoryCarStore;

/// Errors from the car store.
///
/// All of these are fatal to a refresh pass.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("car {0} not found")]
    CarNotFound(CarId),

    #[error("merge request {merge_request} of car {car} not found")]
    MergeRequestNotFound {
        car: CarId,
        merge_request: MergeRequestId,
    },

    #[error("user {user} of car {car} not found")]
    UserNotFound { car: CarId, user: UserId },

    #[error("pipeline {pipeline} of car {car} not found")]
    PipelineNotFound { car: CarId, pipeline: PipelineId },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read and write access to the cars of merge trains.
pub trait CarStore: Send + Sync {
    /// Returns the first `limit` cars of the train in ascending position,
    /// each resolved to its merge request, queuing user and current pipeline.
    fn all_cars(
        &self,
        key: &TrainKey,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TrainCar>, StoreError>> + Send;

    /// Persists a car's status, pipeline and train ref.
    fn update_car(&self, car: &Car) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes a car from its train.
    fn remove_car(
        &self,
        car_id: CarId,
        reason: RemovalReason,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns every train that has at least one car.
    fn active_trains(&self) -> impl Future<Output = Result<Vec<TrainKey>, StoreError>> + Send;
}
