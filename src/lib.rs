//! Merge train refresh coordination.
//!
//! A merge train is the ordered queue of merge requests waiting to land on
//! one target branch. Each car is tested in a pipeline on a train ref that
//! contains its own changes on top of every car ahead of it. This crate
//! keeps those pipelines current:
//!
//! - [`refresh::RefreshService`] walks one train under an exclusive,
//!   TTL-bounded lock, refreshing each car in position order
//! - [`refresh::MergeRequestRefresher`] validates a single car, recreates its
//!   pipeline when the base it was tested on changed, and merges the front car
//!   once its pipeline passes
//! - [`worker::RefreshScheduler`] coalesces refresh requests per train and
//!   runs the poll fallback
//!
//! Persistence and the code forge sit behind the [`store::CarStore`],
//! [`gateway::PipelineCreator`] and [`gateway::MergeExecutor`] traits.

pub mod clock;
pub mod config;
pub mod gateway;
pub mod lock;
pub mod refresh;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;
