//! Stage specifications.

use crate::core::{FailurePolicy, ParameterSet, Phase};
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::platform::{CredentialKind, JobSpec, ServiceUnit};
use crate::store::{references_in, references_in_json, Reference};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a bridged credential's material comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", content = "name", rename_all = "snake_case")]
pub enum SecretSource {
    /// The operator-supplied API key.
    ApiKey,
    /// A resolved stage parameter.
    Parameter(String),
}

/// One credential written by a bridge-credentials stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSpec {
    /// Secret name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Secret shape. String fields may hold output references.
    pub kind: CredentialKind,
    /// Material source.
    pub source: SecretSource,
}

impl CredentialSpec {
    /// Creates a credential spec.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, kind: CredentialKind, source: SecretSource) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            kind,
            source,
        }
    }
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StageAction {
    /// Register capability providers concurrently.
    RegisterProviders {
        /// Provider namespaces.
        namespaces: Vec<String>,
    },
    /// Apply a resource template with the stage parameters.
    Provision {
        /// Template file.
        template: PathBuf,
    },
    /// Fetch credentials for the cluster named by the `cluster` parameter.
    ConnectCluster,
    /// Attach the `registry` parameter's registry to the `cluster` parameter's cluster.
    AttachRegistry,
    /// Write platform credentials.
    BridgeCredentials {
        /// Credentials to write, in order.
        credentials: Vec<CredentialSpec>,
    },
    /// Install service units in order.
    Install {
        /// Units to install.
        units: Vec<ServiceUnit>,
    },
    /// Run a batch job to completion.
    RunJob {
        /// The job.
        job: JobSpec,
    },
}

impl StageAction {
    /// Returns the run phase this action belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::RegisterProviders { .. } | Self::Provision { .. } | Self::ConnectCluster | Self::AttachRegistry => {
                Phase::Provisioning
            }
            Self::BridgeCredentials { .. } => Phase::Bridging,
            Self::Install { .. } => Phase::Installing,
            Self::RunJob { .. } => Phase::LoadingData,
        }
    }

    /// Returns a short action label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::RegisterProviders { .. } => "register-providers",
            Self::Provision { .. } => "provision",
            Self::ConnectCluster => "connect-cluster",
            Self::AttachRegistry => "attach-registry",
            Self::BridgeCredentials { .. } => "bridge-credentials",
            Self::Install { .. } => "install",
            Self::RunJob { .. } => "run-job",
        }
    }
}

/// Specification for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,
    /// Upstream stages, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The action.
    pub action: StageAction,
    /// Failure policy.
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Parameter template; values may hold output references.
    #[serde(default)]
    pub parameters: ParameterSet,
    /// Parameters that must resolve to a non-empty value.
    #[serde(default)]
    pub required: Vec<String>,
    /// Outputs the stage declares.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Optional reference; the stage is skipped when it resolves empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
}

impl StageSpec {
    /// Creates a fatal stage with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, action: StageAction) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            action,
            policy: FailurePolicy::Fatal,
            parameters: ParameterSet::new(),
            required: Vec::new(),
            outputs: Vec::new(),
            gate: None,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    /// Adds dependencies.
    #[must_use]
    pub fn with_dependencies(self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        deps.into_iter().fold(self, |spec, dep| spec.with_dependency(dep))
    }

    /// Marks the stage as tolerated.
    #[must_use]
    pub fn tolerated(mut self) -> Self {
        self.policy = FailurePolicy::Tolerated;
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    /// Adds a required parameter.
    #[must_use]
    pub fn with_required_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.parameters.insert(name.clone(), value);
        if !self.required.contains(&name) {
            self.required.push(name);
        }
        self
    }

    /// Declares outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Gates the stage on an optional reference.
    #[must_use]
    pub fn with_gate(mut self, reference: impl Into<String>) -> Self {
        self.gate = Some(reference.into());
        self
    }

    /// Returns every output reference the stage makes.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs: Vec<Reference> = self.parameters.iter().flat_map(|(_, v)| references_in(v)).collect();
        if let Some(gate) = &self.gate {
            refs.extend(references_in(gate));
        }
        match &self.action {
            StageAction::Install { units } => {
                for unit in units {
                    refs.extend(references_in_json(&unit.values));
                }
            }
            StageAction::RunJob { job } => {
                refs.extend(references_in(&job.image));
                for value in job.env.values() {
                    refs.extend(references_in(value));
                }
            }
            StageAction::BridgeCredentials { credentials } => {
                for cred in credentials {
                    if let CredentialKind::DockerRegistry { server, username } = &cred.kind {
                        refs.extend(references_in(server));
                        refs.extend(references_in(username));
                    }
                }
            }
            _ => {}
        }
        refs
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself or its gate is not a
    /// single optional reference.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        if let Some(gate) = &self.gate {
            if !Reference::parse(gate).is_some_and(|r| r.optional) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' gate '{gate}' must be a single optional reference",
                    self.name
                ))
                .with_stages(vec![self.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-GATE", "Gate is not an optional reference")
                        .with_fix_hint("Write the gate as ${stage.key?}."),
                ));
            }
        }
        for name in &self.required {
            if !self.parameters.contains(name) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' requires parameter '{name}' but never sets it",
                    self.name
                ))
                .with_stages(vec![self.name.clone()]));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_methods() {
        let spec = StageSpec::new("kube-context", StageAction::ConnectCluster)
            .with_dependency("infra")
            .with_dependency("infra")
            .with_required_param("cluster", "${infra.clusterName}")
            .with_param("region", "eastus");

        assert_eq!(spec.dependencies, vec!["infra"]);
        assert_eq!(spec.required, vec!["cluster"]);
        assert_eq!(spec.parameters.len(), 2);
        assert_eq!(spec.action.phase(), Phase::Provisioning);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let spec = StageSpec::new("infra", StageAction::ConnectCluster).with_dependency("infra");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_gate_must_be_optional_reference() {
        let ok = StageSpec::new("attach", StageAction::AttachRegistry).with_gate("${infra.registryName?}");
        assert!(ok.validate().is_ok());

        let err = StageSpec::new("attach", StageAction::AttachRegistry)
            .with_gate("${infra.registryName}")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-GATE"));
    }

    #[test]
    fn test_references_cover_params_values_and_env() {
        let unit = ServiceUnit::chart("milvus", "milvus", "milvus")
            .with_values(serde_json::json!({"storageClass": "${infra.storageClass}"}));
        let install = StageSpec::new("data-tier", StageAction::Install { units: vec![unit] })
            .with_param("x", "${kube-context.ok?}");
        let stages: Vec<_> = install.references().into_iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec!["kube-context", "infra"]);

        let job = JobSpec::new("load", "alpha", "${infra.registryServer}/loader").with_env("PATH_HINT", "${infra.mount}");
        let refs = StageSpec::new("load-data", StageAction::RunJob { job }).references();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_action_serde_tag() {
        let action = StageAction::Provision {
            template: PathBuf::from("templates/main.json"),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "provision");
        assert_eq!(action.label(), "provision");
    }
}
