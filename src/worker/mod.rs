//! Background refresh scheduling.
//!
//! Refresh passes are triggered from two places:
//!
//! - explicit requests, e.g. when a car is queued or a pipeline finishes,
//!   via [`RefreshScheduler::request`]
//! - the poll fallback, which periodically requests every active train so a
//!   missed trigger never strands cars ([`RefreshScheduler::run_poller`])
//!
//! # Module Structure
//!
//! - [`scheduler`]: per-train coalescing of refresh requests
//! - [`poll`]: polling configuration and jitter

mod poll;
mod scheduler;

#[cfg(test)]
mod tests;

pub use poll::PollConfig;
pub use scheduler::{RefreshScheduler, RequestOutcome};
