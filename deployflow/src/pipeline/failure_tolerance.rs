//! Tolerated failure records and the run summary.

use crate::core::{RunState, StageResult, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of a failure that did not halt the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Unit id (`namespace/release`) when a single unit failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Error message.
    pub error: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(stage: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            unit: None,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attributes the failure to a single unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Returns `stage` or `stage/unit`.
    #[must_use]
    pub fn subject(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{} ({unit})", self.stage),
            None => self.stage.clone(),
        }
    }
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// The run id.
    pub run_id: String,
    /// Final run state.
    pub state: RunState,
    /// Every stage result produced or resumed, in execution order.
    pub results: Vec<StageResult>,
    /// Failures that were tolerated.
    pub tolerated: Vec<FailureRecord>,
}

impl RunSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::NotStarted,
            results: Vec::new(),
            tolerated: Vec::new(),
        }
    }

    /// Returns true if the run completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    /// Returns true if any failure was tolerated.
    #[must_use]
    pub fn has_tolerated_failures(&self) -> bool {
        !self.tolerated.is_empty()
    }

    /// Returns the number of results with `status`.
    #[must_use]
    pub fn count(&self, status: StageStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Returns the result for `stage`.
    #[must_use]
    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().rev().find(|r| r.name == stage)
    }

    /// Returns stage names in the order they were reported.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }
}
