//! Error types for the deployflow orchestrator.
//!
//! Every failure the orchestrator can surface maps onto one [`ErrorKind`],
//! and every kind has a deterministic process exit code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Exit code used when a failure carries no command exit status.
pub const GENERIC_EXIT_CODE: i32 = 1;

/// Exit code for a batch job that outlived its bound (matches `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code for a run interrupted by the operator.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// The main error type for deployflow operations.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A required secret or configuration value is absent.
    #[error("Missing required configuration: {name}")]
    PreconditionMissing {
        /// Name of the missing value (usually the environment variable).
        name: String,
    },

    /// The target environment rejected a resource template.
    #[error("Provisioning failed for stage '{stage}': {cause}")]
    ProvisioningFailed {
        /// The provisioning stage.
        stage: String,
        /// Provider diagnostic.
        cause: String,
        /// Exit status of the provider command, if one ran.
        exit_code: Option<i32>,
    },

    /// A parameter references an output that does not exist.
    #[error("{0}")]
    UnresolvedReference(#[from] UnresolvedReferenceError),

    /// The platform refused a credential write.
    #[error("Credential '{name}' rejected in namespace '{namespace}': {cause}")]
    CredentialRejected {
        /// Secret name.
        name: String,
        /// Target namespace.
        namespace: String,
        /// Platform diagnostic.
        cause: String,
        /// Exit status of the platform command, if one ran.
        exit_code: Option<i32>,
    },

    /// A service unit failed to install or upgrade.
    #[error("Install failed for unit '{unit}': {cause}")]
    InstallFailed {
        /// Unit identifier (`namespace/release`).
        unit: String,
        /// Installer diagnostic.
        cause: String,
        /// Exit status of the installer command, if one ran.
        exit_code: Option<i32>,
    },

    /// A batch job did not reach a terminal state within its bound.
    #[error("Job '{job}' did not finish within {waited_secs}s")]
    JobTimedOut {
        /// Job name.
        job: String,
        /// The configured bound in seconds.
        waited_secs: u64,
    },

    /// A batch job reached the failed state.
    #[error("Job '{job}' failed: {cause}")]
    JobFailed {
        /// Job name.
        job: String,
        /// Failure reason reported by the platform.
        cause: String,
    },

    /// A stage's dependency has no succeeded or skipped result.
    #[error("Stage '{stage}' cannot run: dependency '{dependency}' has not succeeded")]
    UnmetDependency {
        /// The stage that was about to run.
        stage: String,
        /// The unsatisfied dependency.
        dependency: String,
    },

    /// The configuration file or an environment override is malformed.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// The stage graph is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage attempted to overwrite its own succeeded outputs.
    #[error("{0}")]
    OutputConflict(#[from] OutputConflictError),

    /// A stored output was looked up but does not exist.
    #[error("No output '{key}' recorded for stage '{stage}'")]
    NotFound {
        /// Stage name.
        stage: String,
        /// Output key.
        key: String,
    },

    /// An external command could not be run or returned malformed data.
    #[error("{0}")]
    Command(#[from] CommandError),

    /// The run was cancelled by the operator.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DeployError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl DeployError {
    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(name: impl Into<String>) -> Self {
        Self::PreconditionMissing { name: name.into() }
    }

    /// Creates a provisioning failure.
    #[must_use]
    pub fn provisioning(stage: impl Into<String>, cause: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ProvisioningFailed {
            stage: stage.into(),
            cause: cause.into(),
            exit_code,
        }
    }

    /// Creates an install failure.
    #[must_use]
    pub fn install(unit: impl Into<String>, cause: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::InstallFailed {
            unit: unit.into(),
            cause: cause.into(),
            exit_code,
        }
    }

    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionMissing { .. } => ErrorKind::PreconditionMissing,
            Self::ProvisioningFailed { .. } => ErrorKind::ProvisioningFailed,
            Self::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            Self::CredentialRejected { .. } => ErrorKind::CredentialRejected,
            Self::InstallFailed { .. } => ErrorKind::InstallFailed,
            Self::JobTimedOut { .. } => ErrorKind::JobTimedOut,
            Self::JobFailed { .. } => ErrorKind::JobFailed,
            Self::UnmetDependency { .. }
            | Self::InvalidConfig { .. }
            | Self::Validation(_)
            | Self::OutputConflict(_)
            | Self::NotFound { .. } => ErrorKind::Invalid,
            Self::Command(_) => ErrorKind::Command,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns the process exit code this error should surface as.
    ///
    /// Failures of an external command propagate that command's status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let propagated = match self {
            Self::ProvisioningFailed { exit_code, .. }
            | Self::CredentialRejected { exit_code, .. }
            | Self::InstallFailed { exit_code, .. } => *exit_code,
            Self::Command(err) => err.exit_code,
            Self::JobTimedOut { .. } => Some(TIMEOUT_EXIT_CODE),
            Self::Cancelled(_) => Some(CANCELLED_EXIT_CODE),
            _ => None,
        };
        match propagated {
            Some(code) if code != 0 => code,
            _ => GENERIC_EXIT_CODE,
        }
    }
}

/// Coarse classification of [`DeployError`], persisted with failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required secret or configuration absent.
    PreconditionMissing,
    /// Resource template rejected.
    ProvisioningFailed,
    /// Output substitution failed.
    UnresolvedReference,
    /// Credential write refused.
    CredentialRejected,
    /// Service unit install failed.
    InstallFailed,
    /// Batch job exceeded its bound.
    JobTimedOut,
    /// Batch job failed.
    JobFailed,
    /// Graph or store contract violated.
    Invalid,
    /// External command could not be run.
    Command,
    /// Operator cancelled the run.
    Cancelled,
    /// IO or serialization failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreconditionMissing => "PreconditionMissing",
            Self::ProvisioningFailed => "ProvisioningFailed",
            Self::UnresolvedReference => "UnresolvedReference",
            Self::CredentialRejected => "CredentialRejected",
            Self::InstallFailed => "InstallFailed",
            Self::JobTimedOut => "JobTimedOut",
            Self::JobFailed => "JobFailed",
            Self::Invalid => "Invalid",
            Self::Command => "Command",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Raised when a `${stage.key}` reference cannot be satisfied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unresolved reference '${{{reference}}}' in stage '{stage}': {reason}")]
pub struct UnresolvedReferenceError {
    /// The stage whose parameters were being resolved.
    pub stage: String,
    /// The reference text without the `${}` wrapper.
    pub reference: String,
    /// Why the reference could not be resolved.
    pub reason: String,
}

impl UnresolvedReferenceError {
    /// Creates a new unresolved reference error.
    #[must_use]
    pub fn new(stage: impl Into<String>, reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// Raised when an external command cannot be spawned or its output parsed.
#[derive(Debug, Clone, Error)]
#[error("Command '{program}' failed: {message}")]
pub struct CommandError {
    /// The program that was invoked.
    pub program: String,
    /// Diagnostic message.
    pub message: String,
    /// Exit status when the command ran to completion.
    pub exit_code: Option<i32>,
}

impl CommandError {
    /// Creates a new command error.
    #[must_use]
    pub fn new(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            message: message.into(),
            exit_code: None,
        }
    }

    /// Sets the exit status.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// Metadata about a graph contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when a stage records a second successful result.
#[derive(Debug, Clone, Error)]
#[error("Output conflict for stage '{stage}': {message}")]
pub struct OutputConflictError {
    /// The stage name.
    pub stage: String,
    /// Additional message.
    pub message: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_exit_code_is_generic() {
        let err = DeployError::precondition("NGC_API_KEY");
        assert_eq!(err.kind(), ErrorKind::PreconditionMissing);
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("NGC_API_KEY"));
    }

    #[test]
    fn test_command_exit_code_propagates() {
        let err = DeployError::provisioning("infra", "QuotaExceeded", Some(3));
        assert_eq!(err.exit_code(), 3);

        let err = DeployError::install("nim/nim-llm", "boom", Some(0));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_timeout_and_cancel_codes() {
        let err = DeployError::JobTimedOut {
            job: "load-data".to_string(),
            waited_secs: 300,
        };
        assert_eq!(err.kind(), ErrorKind::JobTimedOut);
        assert_eq!(err.exit_code(), TIMEOUT_EXIT_CODE);
        assert_eq!(DeployError::Cancelled("ctrl-c".into()).exit_code(), CANCELLED_EXIT_CODE);
    }

    #[test]
    fn test_unresolved_reference_display() {
        let err = UnresolvedReferenceError::new("kube-context", "infra.clusterName", "stage has no outputs");
        assert_eq!(
            err.to_string(),
            "Unresolved reference '${infra.clusterName}' in stage 'kube-context': stage has no outputs"
        );
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        let validation: PipelineValidationError = err.into();
        assert_eq!(validation.code(), Some("GRAPH-CYCLE"));
    }

    #[test]
    fn test_error_kind_serialize() {
        let json = serde_json::to_string(&ErrorKind::InstallFailed).unwrap();
        assert_eq!(json, r#""install_failed""#);
        assert_eq!(ErrorKind::InstallFailed.to_string(), "InstallFailed");
    }
}
