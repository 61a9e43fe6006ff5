//! CI pipeline projection.

use serde::{Deserialize, Serialize};

use super::ids::{PipelineId, Sha};

/// Status of a CI pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl PipelineStatus {
    /// Returns true once the pipeline will not change status any more.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success
                | PipelineStatus::Failed
                | PipelineStatus::Canceled
                | PipelineStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Success)
    }
}

/// A pipeline validating a car's train ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub status: PipelineStatus,
    /// The ref the pipeline runs on (the car's train ref).
    pub ref_path: String,
    /// The merge request head the pipeline validates.
    pub source_sha: Sha,
    /// The predicted target-branch state the merge request was merged onto.
    pub target_sha: Sha,
}

impl Pipeline {
    /// Returns true if the pipeline finished without succeeding.
    pub fn has_failed(&self) -> bool {
        self.status.is_complete() && !self.status.is_success()
    }
}
