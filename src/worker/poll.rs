//! Poll fallback for active trains.
//!
//! Refreshes are normally requested when something about a train changes
//! (a car is queued, a pipeline finishes). A missed trigger would leave a
//! train idle with cars waiting, so every active train is also refreshed
//! periodically.
//!
//! - **Poll interval**: 10 minutes by default (`MERGE_TRAIN_POLL_INTERVAL_MINS`)
//! - **Jitter**: up to 20% added per train, derived from a hash of its key
//! - **Initial stagger**: also hash-derived, so trains do not all poll at once

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::TrainKey;

/// Default poll interval (10 minutes).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;

/// Shortest interval the poller will use.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default jitter percentage (0-100).
const DEFAULT_JITTER_PERCENT: u8 = 20;

/// Configuration for the poll fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Interval between polls of an active train. Values below 10 ms are
    /// treated as 10 ms.
    pub poll_interval: Duration,

    /// Maximum jitter added to `poll_interval`, as a percentage.
    pub jitter_percent: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollConfig {
    pub fn new() -> Self {
        PollConfig {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Reads `MERGE_TRAIN_POLL_INTERVAL_MINS`; other values use defaults.
    pub fn from_env() -> Self {
        let var = std::env::var("MERGE_TRAIN_POLL_INTERVAL_MINS").ok();
        PollConfig {
            poll_interval: parse_poll_interval(var.as_deref()),
            ..Self::new()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// The configured interval, never below 10 ms.
    pub fn interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    pub fn with_jitter_percent(mut self, percent: u8) -> Self {
        self.jitter_percent = percent.min(100);
        self
    }

    /// The poll interval for `key`, including its deterministic jitter.
    ///
    /// `interval * (1 + (hash(key) % jitter_percent) / 100)`
    pub fn poll_interval_with_jitter(&self, key: &TrainKey) -> Duration {
        self.interval().mul_f64(self.jitter_factor(key))
    }

    /// Delay before the first poll of `key`: `hash(key) % (interval / 2)`.
    pub fn initial_poll_delay(&self, key: &TrainKey) -> Duration {
        let max_delay_ms = (self.interval().as_millis() / 2).max(1);
        let delay_ms = u128::from(key_hash(key)) % max_delay_ms;
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    fn jitter_factor(&self, key: &TrainKey) -> f64 {
        if self.jitter_percent == 0 {
            return 1.0;
        }
        let jitter = key_hash(key) % u64::from(self.jitter_percent);
        1.0 + jitter as f64 / 100.0
    }
}

/// Parses a whole number of minutes. Missing, zero, malformed or
/// overflowing values fall back to the default.
fn parse_poll_interval(minutes: Option<&str>) -> Duration {
    minutes
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|mins| *mins > 0)
        .and_then(|mins| mins.checked_mul(60))
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
}

fn key_hash(key: &TrainKey) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
