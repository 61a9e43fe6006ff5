//! Collaborators that act on the forge on behalf of the refresh core.
//!
//! The refresh core never talks to a forge API directly. Pipeline creation,
//! train-ref preparation and merging are delegated through these traits so
//! that embedders can plug in a real API client and tests can record calls.

use std::future::Future;

use thiserror::Error;

use crate::types::{MergeRequest, Pipeline, ProjectId, Sha};

/// Errors from creating a train pipeline.
///
/// These are never fatal to a refresh pass: the car is dropped and the walk
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline creation rejected: {0}")]
    Rejected(String),

    #[error("CI backend error: {0}")]
    Backend(String),
}

/// Errors from git-level operations on the target project.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// The merge request does not apply cleanly onto the requested base.
    #[error("merge conflict")]
    Conflict,

    /// The forge refused the merge (for example because the head moved).
    #[error("merge rejected: {0}")]
    Rejected(String),

    #[error("branch {0} not found")]
    BranchNotFound(String),

    #[error("forge backend error: {0}")]
    Backend(String),
}

/// Creates CI pipelines for train refs.
pub trait PipelineCreator: Send + Sync {
    /// Starts a pipeline on `ref_path` validating `source_sha` merged onto
    /// `target_sha`.
    fn create_pipeline(
        &self,
        project: ProjectId,
        ref_path: &str,
        source_sha: &Sha,
        target_sha: &Sha,
    ) -> impl Future<Output = Result<Pipeline, PipelineError>> + Send;
}

/// Performs merges and the ref bookkeeping around them.
pub trait MergeExecutor: Send + Sync {
    /// Merges `merge_request` into its target branch, provided its head is
    /// still `sha`. Returns the merge commit.
    fn merge(
        &self,
        merge_request: &MergeRequest,
        sha: &Sha,
    ) -> impl Future<Output = Result<Sha, MergeError>> + Send;

    /// Returns the current head of `branch`.
    fn branch_head(
        &self,
        project: ProjectId,
        branch: &str,
    ) -> impl Future<Output = Result<Sha, MergeError>> + Send;

    /// Writes `ref_path` as the merge of `merge_request` onto `base`.
    ///
    /// Returns the commit the ref now points to, or [`MergeError::Conflict`].
    fn prepare_train_ref(
        &self,
        merge_request: &MergeRequest,
        ref_path: &str,
        base: &Sha,
    ) -> impl Future<Output = Result<Sha, MergeError>> + Send;
}
