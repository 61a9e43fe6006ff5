//! In-memory car store.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{
    Car, CarId, MergeRequest, MergeRequestId, Pipeline, PipelineId, PipelineStatus, RemovalReason,
    TrainCar, TrainKey, User, UserId,
};

use super::{CarStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    cars: HashMap<CarId, Car>,
    merge_requests: HashMap<MergeRequestId, MergeRequest>,
    users: HashMap<UserId, User>,
    pipelines: HashMap<PipelineId, Pipeline>,
    removals: Vec<(Car, RemovalReason)>,
}

impl Tables {
    fn resolve(&self, car: &Car) -> Result<TrainCar, StoreError> {
        let merge_request = self
            .merge_requests
            .get(&car.merge_request_id)
            .cloned()
            .ok_or(StoreError::MergeRequestNotFound {
                car: car.id,
                merge_request: car.merge_request_id,
            })?;
        let user = self
            .users
            .get(&car.user_id)
            .cloned()
            .ok_or(StoreError::UserNotFound {
                car: car.id,
                user: car.user_id,
            })?;
        let pipeline = match car.pipeline_id {
            Some(id) => Some(self.pipelines.get(&id).cloned().ok_or(
                StoreError::PipelineNotFound {
                    car: car.id,
                    pipeline: id,
                },
            )?),
            None => None,
        };
        Ok(TrainCar {
            car: car.clone(),
            merge_request,
            user,
            pipeline,
        })
    }
}

/// A [`CarStore`] held in memory.
///
/// Besides the trait surface it exposes the merge request, user and
/// pipeline records the cars refer to, and keeps a history of removed cars.
#[derive(Debug, Default)]
pub struct MemoryCarStore {
    tables: Mutex<Tables>,
}

impl MemoryCarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_car(&self, car: Car) {
        self.tables.lock().await.cars.insert(car.id, car);
    }

    pub async fn upsert_merge_request(&self, merge_request: MergeRequest) {
        self.tables
            .lock()
            .await
            .merge_requests
            .insert(merge_request.id, merge_request);
    }

    pub async fn upsert_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn upsert_pipeline(&self, pipeline: Pipeline) {
        self.tables
            .lock()
            .await
            .pipelines
            .insert(pipeline.id, pipeline);
    }

    /// Sets the status of a known pipeline; returns false if it is unknown.
    pub async fn set_pipeline_status(&self, id: PipelineId, status: PipelineStatus) -> bool {
        match self.tables.lock().await.pipelines.get_mut(&id) {
            Some(pipeline) => {
                pipeline.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn car(&self, id: CarId) -> Option<Car> {
        self.tables.lock().await.cars.get(&id).cloned()
    }

    pub async fn merge_request(&self, id: MergeRequestId) -> Option<MergeRequest> {
        self.tables.lock().await.merge_requests.get(&id).cloned()
    }

    pub async fn pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        self.tables.lock().await.pipelines.get(&id).cloned()
    }

    /// Cars of a train in position order, without resolving them.
    pub async fn cars_in(&self, key: &TrainKey) -> Vec<Car> {
        let tables = self.tables.lock().await;
        let mut cars: Vec<Car> = tables
            .cars
            .values()
            .filter(|car| car.train_key() == *key)
            .cloned()
            .collect();
        cars.sort_by_key(|car| (car.position, car.id));
        cars
    }

    /// Every car removed so far, oldest first.
    pub async fn removals(&self) -> Vec<(Car, RemovalReason)> {
        self.tables.lock().await.removals.clone()
    }
}

impl CarStore for MemoryCarStore {
    async fn all_cars(&self, key: &TrainKey, limit: usize) -> Result<Vec<TrainCar>, StoreError> {
        let tables = self.tables.lock().await;
        let mut cars: Vec<&Car> = tables
            .cars
            .values()
            .filter(|car| car.target_project_id == key.target_project_id)
            .filter(|car| car.target_branch == key.target_branch)
            .collect();
        cars.sort_by_key(|car| (car.position, car.id));

        cars.into_iter()
            .take(limit)
            .map(|car| tables.resolve(car))
            .collect()
    }

    async fn update_car(&self, car: &Car) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let slot = tables
            .cars
            .get_mut(&car.id)
            .ok_or(StoreError::CarNotFound(car.id))?;
        *slot = car.clone();
        Ok(())
    }

    async fn remove_car(&self, car_id: CarId, reason: RemovalReason) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let car = tables
            .cars
            .remove(&car_id)
            .ok_or(StoreError::CarNotFound(car_id))?;
        debug!(car = %car_id, merge_request = %car.merge_request_id, ?reason, "car removed");
        tables.removals.push((car, reason));
        Ok(())
    }

    async fn active_trains(&self) -> Result<Vec<TrainKey>, StoreError> {
        let tables = self.tables.lock().await;
        let keys: BTreeSet<TrainKey> = tables.cars.values().map(Car::train_key).collect();
        Ok(keys.into_iter().collect())
    }
}
