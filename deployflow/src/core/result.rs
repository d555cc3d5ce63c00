//! Immutable stage results recorded in the output store.

use super::StageStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of executing a stage or a single service unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name (or `namespace/release` for unit results).
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Produced outputs. Empty unless the stage declares outputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    /// Diagnostic text (failure cause, skip reason, tolerated failures).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
    /// Fingerprint of the resolved parameters the stage ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Per-unit results for install stages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<StageResult>,
}

impl StageResult {
    fn finished(name: impl Into<String>, status: StageStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status,
            outputs: BTreeMap::new(),
            diagnostic: None,
            started_at,
            ended_at: Utc::now(),
            fingerprint: None,
            units: Vec::new(),
        }
    }

    /// Creates a succeeded result.
    #[must_use]
    pub fn succeeded(name: impl Into<String>, started_at: DateTime<Utc>, outputs: BTreeMap<String, String>) -> Self {
        let mut result = Self::finished(name, StageStatus::Succeeded, started_at);
        result.outputs = outputs;
        result
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(name: impl Into<String>, started_at: DateTime<Utc>, diagnostic: impl Into<String>) -> Self {
        let mut result = Self::finished(name, StageStatus::Failed, started_at);
        result.diagnostic = Some(diagnostic.into());
        result
    }

    /// Creates a skipped result.
    #[must_use]
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::finished(name, StageStatus::Skipped, Utc::now());
        result.diagnostic = Some(reason.into());
        result
    }

    /// Sets the diagnostic text.
    #[must_use]
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    /// Sets the parameter fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Attaches per-unit results.
    #[must_use]
    pub fn with_units(mut self, units: Vec<Self>) -> Self {
        self.units = units;
        self
    }

    /// Returns true if the result is `succeeded`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    /// Returns true if the result is `failed`.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Returns the named output.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }

    /// Returns the unit results that failed.
    pub fn failed_units(&self) -> impl Iterator<Item = &Self> {
        self.units.iter().filter(|u| u.is_failure())
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}
