//! Refreshing a single car.
//!
//! Evaluation of one car proceeds in a fixed order:
//!
//! 1. **Validate.** A closed, retargeted, draft, conflicting or no longer
//!    permitted merge request is dropped. So is a car whose pipeline failed
//!    on exactly the state it would still be validated against.
//! 2. **Re-validate.** If anything ahead changed, or the car has no usable
//!    pipeline, prepare its train ref on top of the expected base and start
//!    a new pipeline.
//! 3. **Merge.** The first car of the train merges once its pipeline passed.
//! 4. Otherwise **wait**.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::gateway::{MergeError, MergeExecutor, PipelineCreator};
use crate::store::CarStore;
use crate::types::{CarStatus, DropReason, RemovalReason, Sha, TrainCar};

use super::{CarRefresher, RefreshContext, RefreshError, RefreshResult};

/// The production [`CarRefresher`].
pub struct MergeRequestRefresher<S, P, M> {
    store: Arc<S>,
    pipelines: Arc<P>,
    merges: Arc<M>,
}

impl<S, P, M> MergeRequestRefresher<S, P, M>
where
    S: CarStore,
    P: PipelineCreator,
    M: MergeExecutor,
{
    pub fn new(store: Arc<S>, pipelines: Arc<P>, merges: Arc<M>) -> Self {
        MergeRequestRefresher {
            store,
            pipelines,
            merges,
        }
    }

    /// Removes the car from its train.
    async fn drop_car(
        &self,
        train_car: &TrainCar,
        reason: DropReason,
    ) -> Result<RefreshResult, RefreshError> {
        info!(
            car = %train_car.car.id,
            merge_request = %train_car.merge_request.id,
            %reason,
            "dropping car from train"
        );
        self.store
            .remove_car(
                train_car.car.id,
                RemovalReason::Dropped {
                    reason: reason.clone(),
                },
            )
            .await?;
        Ok(RefreshResult::dropped(reason))
    }

    /// The commit this car must be validated on top of.
    async fn expected_base(
        &self,
        train_car: &TrainCar,
        ctx: &RefreshContext,
    ) -> Result<Sha, RefreshError> {
        if let Some(previous) = &ctx.previous_ref {
            return Ok(previous.clone());
        }
        let car = &train_car.car;
        self.merges
            .branch_head(car.target_project_id, &car.target_branch)
            .await
            .map_err(|source| RefreshError::BranchHead {
                branch: car.target_branch.clone(),
                source,
            })
    }

    async fn recreate_pipeline(
        &self,
        train_car: &TrainCar,
        base: &Sha,
    ) -> Result<RefreshResult, RefreshError> {
        let mr = &train_car.merge_request;
        let ref_path = train_car.car.train_ref_path();

        let train_ref = match self.merges.prepare_train_ref(mr, &ref_path, base).await {
            Ok(sha) => sha,
            Err(MergeError::Conflict) => {
                return self.drop_car(train_car, DropReason::Conflict).await;
            }
            Err(e) => {
                let reason = DropReason::PipelineCreationFailed {
                    message: e.to_string(),
                };
                return self.drop_car(train_car, reason).await;
            }
        };

        let pipeline = match self
            .pipelines
            .create_pipeline(train_car.car.target_project_id, &ref_path, &mr.head_sha, base)
            .await
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let reason = DropReason::PipelineCreationFailed {
                    message: e.to_string(),
                };
                return self.drop_car(train_car, reason).await;
            }
        };

        let mut car = train_car.car.clone();
        car.pipeline_id = Some(pipeline.id);
        car.status = CarStatus::Fresh;
        car.train_ref_sha = Some(train_ref.clone());
        self.store.update_car(&car).await?;

        info!(
            car = %car.id,
            merge_request = %mr.id,
            pipeline = %pipeline.id,
            base = %base.short(),
            train_ref = %train_ref.short(),
            "created train pipeline"
        );
        Ok(RefreshResult::pipeline_created(train_ref))
    }

    async fn merge(&self, train_car: &TrainCar) -> Result<RefreshResult, RefreshError> {
        let mr = &train_car.merge_request;

        let mut car = train_car.car.clone();
        car.status = CarStatus::Merging;
        self.store.update_car(&car).await?;

        match self.merges.merge(mr, &mr.head_sha).await {
            Ok(merge_commit_sha) => {
                info!(
                    car = %car.id,
                    merge_request = %mr.id,
                    merge_commit = %merge_commit_sha.short(),
                    "merged"
                );
                self.store
                    .remove_car(car.id, RemovalReason::Merged { merge_commit_sha })
                    .await?;
                Ok(RefreshResult::merged())
            }
            Err(e) => {
                warn!(car = %car.id, merge_request = %mr.id, error = %e, "merge failed");
                let reason = DropReason::MergeFailed {
                    message: e.to_string(),
                };
                self.drop_car(train_car, reason).await
            }
        }
    }
}

/// Checks the merge request and user, independent of the train's state.
fn validate(train_car: &TrainCar) -> Result<(), DropReason> {
    let mr = &train_car.merge_request;

    if !mr.state.is_open() {
        return Err(DropReason::MergeRequestClosed);
    }
    if mr.target_branch != train_car.car.target_branch {
        return Err(DropReason::TargetBranchChanged {
            target_branch: mr.target_branch.clone(),
        });
    }
    if !mr.is_mergeable_state() {
        return Err(DropReason::NotMergeable);
    }
    if !train_car.user.can_merge {
        return Err(DropReason::PermissionDenied);
    }
    Ok(())
}

/// Returns true if the car's current pipeline does not validate what would
/// be merged.
fn needs_new_pipeline(train_car: &TrainCar, ctx: &RefreshContext, base: &Sha) -> bool {
    if ctx.require_recreate
        || train_car.car.status.requires_new_pipeline()
        || train_car.car.train_ref_sha.is_none()
    {
        return true;
    }
    match &train_car.pipeline {
        None => true,
        Some(pipeline) => {
            pipeline.target_sha != *base || pipeline.source_sha != train_car.merge_request.head_sha
        }
    }
}

impl<S, P, M> CarRefresher for MergeRequestRefresher<S, P, M>
where
    S: CarStore,
    P: PipelineCreator,
    M: MergeExecutor,
{
    #[instrument(
        skip_all,
        fields(
            car = %train_car.car.id,
            merge_request = %train_car.merge_request.id,
            require_recreate = ctx.require_recreate,
        )
    )]
    async fn refresh(
        &self,
        train_car: &TrainCar,
        ctx: &RefreshContext,
    ) -> Result<RefreshResult, RefreshError> {
        if let Err(reason) = validate(train_car) {
            return self.drop_car(train_car, reason).await;
        }

        let base = self.expected_base(train_car, ctx).await?;

        if needs_new_pipeline(train_car, ctx, &base) {
            return self.recreate_pipeline(train_car, &base).await;
        }

        // Only reachable with a pipeline on the current base.
        let Some(pipeline) = &train_car.pipeline else {
            return self.recreate_pipeline(train_car, &base).await;
        };

        if pipeline.has_failed() {
            return self
                .drop_car(
                    train_car,
                    DropReason::PipelineFailed {
                        pipeline_id: pipeline.id,
                    },
                )
                .await;
        }

        if ctx.first_in_train && pipeline.status.is_success() {
            return self.merge(train_car).await;
        }

        debug!(
            pipeline = %pipeline.id,
            status = ?pipeline.status,
            first_in_train = ctx.first_in_train,
            "waiting"
        );
        Ok(RefreshResult::waiting(train_car.car.train_ref_sha.clone()))
    }
}
