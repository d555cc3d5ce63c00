//! Test doubles for the orchestrator and its adapters.
//!
//! This module provides:
//! - A scripted [`CommandRunner`](crate::platform::CommandRunner) for adapter tests
//! - In-process adapter fakes sharing one call log
//! - [`FakePlatform`], wiring the fakes into orchestrator collaborators

mod mocks;
mod scripted;

pub use mocks::{
    CallLog, FakeClusterAccess, FakeCredentialBridge, FakeInstaller, FakeJobBackend, FakePlatform,
    FakeProvisioner,
};
pub use scripted::ScriptedRunner;
