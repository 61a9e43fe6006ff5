//! Core domain types for the merge train refresh core.
//!
//! This module contains the identifiers, records and projections used
//! throughout the crate, designed to encode invariants via the type system.

pub mod car;
pub mod ids;
pub mod merge_request;
pub mod pipeline;
pub mod train;

// Re-export commonly used types at the module level
pub use car::{Car, CarStatus, DropReason, RemovalReason, TrainCar};
pub use ids::{CarId, InvalidSha, MergeRequestId, PipelineId, ProjectId, Sha, UserId};
pub use merge_request::{MergeRequest, MergeRequestState, MergeStatus, User};
pub use pipeline::{Pipeline, PipelineStatus};
pub use train::TrainKey;
