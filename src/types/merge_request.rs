//! Merge request and user types as seen by the refresh core.
//!
//! These are read-only projections of records owned by the surrounding
//! product; the store resolves them when it loads the cars of a train.

use serde::{Deserialize, Serialize};

use super::ids::{MergeRequestId, ProjectId, Sha, UserId};

/// The lifecycle state of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Opened,
    Closed,
    Merged,
    /// Transiently locked while a merge is in progress.
    Locked,
}

impl MergeRequestState {
    pub fn is_open(&self) -> bool {
        matches!(self, MergeRequestState::Opened)
    }
}

/// Whether the merge request can be merged cleanly into its target branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    CanBeMerged,
    CannotBeMerged,
    /// Mergeability has not been computed yet.
    Unchecked,
}

/// A merge request queued (or formerly queued) on a train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub project_id: ProjectId,
    pub source_branch: String,
    pub target_branch: String,
    /// The head commit of the source branch.
    pub head_sha: Sha,
    pub state: MergeRequestState,
    pub merge_status: MergeStatus,
    pub draft: bool,
}

impl MergeRequest {
    /// Returns true if nothing about the merge request itself prevents merging.
    ///
    /// CI and approval state are not considered here; the train's own
    /// pipeline is the CI gate.
    pub fn is_mergeable_state(&self) -> bool {
        self.state.is_open() && !self.draft && self.merge_status != MergeStatus::CannotBeMerged
    }
}

/// The user who queued a car.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Whether the user may still merge into the train's target branch.
    ///
    /// Resolved by the store against current project permissions, so a
    /// permission revoked after queuing shows up here.
    pub can_merge: bool,
}
