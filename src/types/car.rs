//! Train cars: one merge request's membership in a train.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{CarId, MergeRequestId, PipelineId, ProjectId, Sha, UserId};
use super::merge_request::{MergeRequest, User};
use super::pipeline::Pipeline;
use super::train::TrainKey;

/// Where a car is in its validation lifecycle.
///
/// ```text
/// Idle ──► Fresh ──► Merging ──► (removed: merged)
///   ▲        │
///   └ Stale ◄┘  (predecessor set changed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarStatus {
    /// Queued, no train pipeline yet.
    Idle,

    /// The car's pipeline validated a predecessor set that no longer holds.
    Stale,

    /// A pipeline exists for the current predecessor set.
    Fresh,

    /// A merge has been started for this car.
    Merging,
}

impl CarStatus {
    /// Returns true if the car cannot be merged without a new pipeline.
    pub fn requires_new_pipeline(&self) -> bool {
        matches!(self, CarStatus::Idle | CarStatus::Stale)
    }
}

/// A car record as persisted by the car store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: CarId,
    pub merge_request_id: MergeRequestId,
    pub target_project_id: ProjectId,
    pub target_branch: String,
    /// The user who queued the merge request.
    pub user_id: UserId,
    /// Insertion order within the train; the sole ordering key.
    pub position: u64,
    pub pipeline_id: Option<PipelineId>,
    pub status: CarStatus,
    /// The commit of the train ref that the current pipeline validates.
    pub train_ref_sha: Option<Sha>,
}

impl Car {
    /// Creates a freshly queued car with no pipeline.
    pub fn new(
        id: CarId,
        merge_request_id: MergeRequestId,
        key: &TrainKey,
        user_id: UserId,
        position: u64,
    ) -> Self {
        Car {
            id,
            merge_request_id,
            target_project_id: key.target_project_id,
            target_branch: key.target_branch.clone(),
            user_id,
            position,
            pipeline_id: None,
            status: CarStatus::Idle,
            train_ref_sha: None,
        }
    }

    pub fn train_key(&self) -> TrainKey {
        TrainKey::new(self.target_project_id, self.target_branch.clone())
    }

    /// The ref a car's train pipeline runs on.
    pub fn train_ref_path(&self) -> String {
        format!("refs/merge-requests/{}/train", self.merge_request_id.0)
    }
}

/// A car resolved to everything needed to refresh it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainCar {
    pub car: Car,
    pub merge_request: MergeRequest,
    pub user: User,
    pub pipeline: Option<Pipeline>,
}

/// Why a car was dropped from its train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// The merge request was closed or merged outside the train.
    MergeRequestClosed,

    /// The merge request now targets a different branch.
    TargetBranchChanged { target_branch: String },

    /// The merge request is a draft or has conflicts with its target.
    NotMergeable,

    /// The queuing user is no longer allowed to merge.
    PermissionDenied,

    /// The train pipeline finished without succeeding.
    PipelineFailed { pipeline_id: PipelineId },

    /// Merging onto the predecessor state produced conflicts.
    Conflict,

    /// A new train pipeline could not be created.
    PipelineCreationFailed { message: String },

    /// The merge itself was rejected.
    MergeFailed { message: String },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MergeRequestClosed => write!(f, "the merge request is not open"),
            DropReason::TargetBranchChanged { target_branch } => {
                write!(f, "the target branch was changed to {}", target_branch)
            }
            DropReason::NotMergeable => write!(f, "the merge request is not mergeable"),
            DropReason::PermissionDenied => {
                write!(f, "the user is not allowed to merge this merge request")
            }
            DropReason::PipelineFailed { pipeline_id } => {
                write!(f, "pipeline {} did not succeed", pipeline_id)
            }
            DropReason::Conflict => write!(f, "merging onto the train produced conflicts"),
            DropReason::PipelineCreationFailed { message } => {
                write!(f, "failed to create pipeline: {}", message)
            }
            DropReason::MergeFailed { message } => write!(f, "failed to merge: {}", message),
        }
    }
}

/// Why a car left its train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemovalReason {
    Merged { merge_commit_sha: Sha },
    Dropped { reason: DropReason },
}
