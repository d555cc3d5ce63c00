//! Core domain model types for deployflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status, failure policy, phase and run state enums
//! - Ordered parameter sets
//! - Immutable stage results

mod params;
mod result;
mod status;

pub use params::ParameterSet;
pub use result::StageResult;
pub use status::{FailurePolicy, Phase, RunState, StageStatus};
