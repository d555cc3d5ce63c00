//! Adapters for the cloud provider and the container platform.
//!
//! Each collaborator is a trait with one CLI-backed implementation:
//!
//! - [`ResourceProvisioner`] / [`AzCliProvisioner`]: resource templates
//! - [`ClusterAccess`] / [`AzCliClusterAccess`]: cluster credentials and registry attach
//! - [`CredentialBridge`] / [`KubectlCredentialBridge`]: platform secrets
//! - [`ServiceInstaller`] / [`HelmInstaller`]: service units
//! - [`JobBackend`] / [`KubectlJobBackend`]: batch jobs, driven by [`BatchJobRunner`]
//!
//! All of them run external tools through a [`CommandRunner`].

mod command;
mod credentials;
mod installer;
mod jobs;
mod provisioner;
mod status;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use credentials::{
    credential_manifest, AzCliClusterAccess, ClusterAccess, CredentialBridge, CredentialKind,
    KubectlCredentialBridge, Secret,
};
pub use installer::{apply_units, ApplyReport, HelmInstaller, ServiceInstaller, ServiceUnit, UnitSource};
pub use jobs::{BatchJobRunner, JobBackend, JobPhase, JobSpec, KubectlJobBackend};
#[cfg(test)]
pub use provisioner::MockResourceProvisioner;
pub use provisioner::{register_providers, AzCliProvisioner, ResourceProvisioner, TargetEnvironment};
pub use status::{StatusReporter, StatusSnapshot, UnitStatus};
