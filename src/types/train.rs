//! Train identity.
//!
//! A train has no persisted record of its own: it is the ordered set of cars
//! sharing a target project and branch. `TrainKey` names that set and is also
//! the serialization domain for the exclusive lock.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::ProjectId;

/// Identifies one merge train: `(target_project_id, target_branch)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrainKey {
    pub target_project_id: ProjectId,
    pub target_branch: String,
}

impl TrainKey {
    pub fn new(target_project_id: impl Into<ProjectId>, target_branch: impl Into<String>) -> Self {
        TrainKey {
            target_project_id: target_project_id.into(),
            target_branch: target_branch.into(),
        }
    }

    /// The key under which the exclusive lock and refresh signal are stored.
    pub fn lock_key(&self) -> String {
        format!(
            "merge_train:{}:{}",
            self.target_project_id, self.target_branch
        )
    }

    /// [`lock_key`](Self::lock_key) made safe for use as a file name.
    ///
    /// Branch names may contain `/` and other characters that are not valid in
    /// a single path component, so every byte outside `[A-Za-z0-9._-]` is
    /// percent-encoded.
    pub fn file_stem(&self) -> String {
        let mut out = String::new();
        for b in self.lock_key().bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02X}", b));
            }
        }
        out
    }
}

impl fmt::Display for TrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_project_id, self.target_branch)
    }
}
