//! Context management for run execution.
//!
//! This module provides:
//! - Run identity keyed by deployment run id
//! - Per-stage execution context carrying resolved parameters, the
//!   cancellation token and the event sink

mod identity;
mod stage;

pub use identity::RunIdentity;
pub use stage::StageContext;
