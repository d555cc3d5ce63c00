//! Stage graph construction.
//!
//! This module provides:
//! - Stage specifications and actions
//! - A builder that validates dependencies, cycles and output references
//! - The topologically ordered stage graph
//! - Tolerated failure records and the run summary

mod builder;
mod failure_tolerance;
mod graph;
mod spec;

pub use builder::PipelineBuilder;
pub use failure_tolerance::{FailureRecord, RunSummary};
pub use graph::StageGraph;
pub use spec::{CredentialSpec, SecretSource, StageAction, StageSpec};
