//! Stage status, failure policy, and run state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of a finished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed and its outputs are available.
    Succeeded,
    /// Stage failed.
    Failed,
    /// Stage was not executed (gate closed).
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if dependents may proceed past this stage.
    #[must_use]
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// How a failure of a stage or service unit affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the run immediately.
    #[default]
    Fatal,
    /// Record the failure and continue.
    Tolerated,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Tolerated => write!(f, "tolerated"),
        }
    }
}

/// The bring-up phase a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Cloud resources are being created.
    Provisioning,
    /// Credentials are being carried into the platform.
    Bridging,
    /// Service units are being installed.
    Installing,
    /// The batch data-load job is running.
    LoadingData,
}

/// Lifecycle of a single orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    /// No stage has executed.
    #[default]
    NotStarted,
    /// Provisioning stages are executing.
    Provisioning,
    /// Credential stages are executing.
    Bridging,
    /// Install stages are executing.
    Installing,
    /// The data-load job is executing.
    LoadingData,
    /// Every stage finished without a fatal failure.
    Complete,
    /// A fatal failure halted the run in the named stage.
    Failed(String),
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Provisioning => 1,
            Self::Bridging => 2,
            Self::Installing => 3,
            Self::LoadingData => 4,
            Self::Complete => 5,
            Self::Failed(_) => 6,
        }
    }

    /// Returns true for `Complete` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }

    /// Moves forward into the state for `phase`.
    ///
    /// The state never moves backwards; terminal states absorb.
    pub fn enter(&mut self, phase: Phase) {
        let next = match phase {
            Phase::Provisioning => Self::Provisioning,
            Phase::Bridging => Self::Bridging,
            Phase::Installing => Self::Installing,
            Phase::LoadingData => Self::LoadingData,
        };
        if !self.is_terminal() && next.rank() > self.rank() {
            *self = next;
        }
    }

    /// Marks the run failed in `stage`.
    pub fn fail(&mut self, stage: impl Into<String>) {
        if !self.is_terminal() {
            *self = Self::Failed(stage.into());
        }
    }

    /// Marks the run complete.
    pub fn complete(&mut self) {
        if !self.is_terminal() {
            *self = Self::Complete;
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Bridging => write!(f, "bridging"),
            Self::Installing => write!(f, "installing"),
            Self::LoadingData => write!(f, "loading_data"),
            Self::Complete => write!(f, "complete"),
            Self::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}
