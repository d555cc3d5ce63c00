//! Run identity for tracking deployment runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one deployment run.
///
/// The run id keys the persisted output store, so a retried run that reuses
/// the id resumes where the previous attempt stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// The deployment run identifier.
    pub run_id: String,
    /// When this identity was created.
    pub created_at: DateTime<Utc>,
}

impl RunIdentity {
    /// Creates a new run identity with a time-ordered generated id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_run_id(Uuid::now_v7().to_string())
    }

    /// Creates a run identity with a specific id.
    #[must_use]
    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Returns true if `run_id` is safe to use as a file name.
    #[must_use]
    pub fn is_valid_run_id(run_id: &str) -> bool {
        !run_id.is_empty()
            && run_id.len() <= 128
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.run_id)
    }
}
