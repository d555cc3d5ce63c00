//! # Deployflow
//!
//! A dependency-ordered provisioning and bring-up orchestrator.
//!
//! Deployflow takes an environment from nothing to a running application
//! stack in a fixed sequence of stages:
//!
//! - **Provisioning**: register capability providers, apply the resource
//!   template, connect to the cluster and attach the registry
//! - **Credential bridging**: carry the API key into platform secrets
//! - **Installation**: install the operator, data tier, inference services
//!   and the agent workload, each unit with its own failure policy
//! - **Data load**: run a bounded batch job against the provisioned storage
//!
//! Outputs of upstream stages flow downstream through `${stage.key}`
//! references. Every stage result is persisted, so a failed run can be
//! resumed under the same run id.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deployflow::prelude::*;
//!
//! let config = DeployConfig::from_env(None)?;
//! let runner = Arc::new(ProcessRunner::new());
//! let orchestrator = Orchestrator::new(
//!     config.clone(),
//!     Collaborators::from_runner(runner, config.poll_interval()),
//! );
//!
//! let summary = orchestrator.deploy(None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod platform;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::DeployConfig;
    pub use crate::context::{RunIdentity, StageContext};
    pub use crate::core::{FailurePolicy, ParameterSet, Phase, RunState, StageResult, StageStatus};
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, DeployError, ErrorKind, OutputConflictError,
        PipelineValidationError, UnresolvedReferenceError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::orchestrator::{pipeline, Collaborators, Orchestrator, RunError, StatusReport};
    pub use crate::pipeline::{
        CredentialSpec, FailureRecord, PipelineBuilder, RunSummary, SecretSource, StageAction, StageGraph,
        StageSpec,
    };
    pub use crate::platform::{
        CommandRunner, CredentialKind, JobSpec, ProcessRunner, Secret, ServiceUnit, TargetEnvironment,
    };
    pub use crate::store::OutputStore;
}
