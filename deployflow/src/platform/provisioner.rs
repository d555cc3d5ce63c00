//! Declarative resource provisioning through the `az` CLI.

use super::command::{CommandRunner, CommandSpec};
use crate::core::{ParameterSet, StageResult};
use crate::errors::DeployError;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Where resources are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEnvironment {
    /// Subscription id; the CLI default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Resource group that owns every created resource.
    pub resource_group: String,
    /// Region for the resource group.
    pub region: String,
}

impl TargetEnvironment {
    /// Creates a target.
    #[must_use]
    pub fn new(resource_group: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            subscription: None,
            resource_group: resource_group.into(),
            region: region.into(),
        }
    }

    /// Sets the subscription.
    #[must_use]
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    fn scoped(&self, spec: CommandSpec) -> CommandSpec {
        spec.opt("--subscription", self.subscription.as_deref())
    }
}

/// Applies resource templates and manages provider registration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Applies `template` with `params` and returns every deployment output.
    ///
    /// Blocks until the provider reports a terminal state. Every name in
    /// `outputs` must be present in the result; undeclared outputs such as an
    /// optional registry are passed through as well.
    async fn provision(
        &self,
        stage: &str,
        template: &Path,
        params: &ParameterSet,
        outputs: &[String],
        target: &TargetEnvironment,
    ) -> Result<StageResult, DeployError>;

    /// Registers a capability provider namespace and waits for it.
    async fn register_provider(&self, namespace: &str) -> Result<(), DeployError>;

    /// Starts deletion of everything in the target. Does not wait.
    async fn teardown(&self, target: &TargetEnvironment) -> Result<(), DeployError>;
}

/// Registers every namespace concurrently and waits for all of them.
///
/// Returns the failures, keyed by namespace.
pub async fn register_providers(
    provisioner: &dyn ResourceProvisioner,
    namespaces: &[String],
) -> Vec<(String, DeployError)> {
    let pending = namespaces.iter().map(|ns| async move {
        let outcome = provisioner.register_provider(ns).await;
        (ns.clone(), outcome)
    });
    join_all(pending)
        .await
        .into_iter()
        .filter_map(|(ns, outcome)| outcome.err().map(|e| (ns, e)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    #[serde(default)]
    properties: DeploymentProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    outputs: Option<BTreeMap<String, DeploymentOutput>>,
}

#[derive(Debug, Deserialize)]
struct DeploymentOutput {
    #[serde(default)]
    value: serde_json::Value,
}

fn flatten(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// [`ResourceProvisioner`] backed by `az deployment group create`.
#[derive(Clone)]
pub struct AzCliProvisioner {
    runner: Arc<dyn CommandRunner>,
}

impl AzCliProvisioner {
    /// Creates a provisioner that runs `az` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ensure_group(&self, stage: &str, target: &TargetEnvironment) -> Result<(), DeployError> {
        let spec = target.scoped(
            CommandSpec::new("az")
                .args(["group", "create", "--name", target.resource_group.as_str()])
                .args(["--location", target.region.as_str(), "--output", "none"]),
        );
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(DeployError::provisioning(stage, out.diagnostic(), Some(out.exit_code)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AzCliProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzCliProvisioner").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceProvisioner for AzCliProvisioner {
    #[instrument(skip(self, template, params, outputs, target), fields(template = %template.display()))]
    async fn provision(
        &self,
        stage: &str,
        template: &Path,
        params: &ParameterSet,
        outputs: &[String],
        target: &TargetEnvironment,
    ) -> Result<StageResult, DeployError> {
        let started = Utc::now();
        self.ensure_group(stage, target).await?;

        let mut spec = CommandSpec::new("az")
            .args(["deployment", "group", "create", "--name", stage])
            .args(["--resource-group", target.resource_group.as_str()])
            .arg("--template-file")
            .arg(template.display().to_string());
        if !params.is_empty() {
            spec = spec.arg("--parameters").args(params.to_assignments());
        }
        let spec = target.scoped(spec.args(["--output", "json"]));

        info!(stage, resource_group = %target.resource_group, "Applying resource template");
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(DeployError::provisioning(stage, out.diagnostic(), Some(out.exit_code)));
        }

        let response: DeploymentResponse = out.json("az")?;
        if let Some(state) = response.properties.provisioning_state.as_deref() {
            if state != "Succeeded" {
                return Err(DeployError::provisioning(
                    stage,
                    format!("deployment finished in state {state}"),
                    None,
                ));
            }
        }

        let produced: BTreeMap<String, String> = response
            .properties
            .outputs
            .unwrap_or_default()
            .iter()
            .map(|(name, output)| (name.clone(), flatten(&output.value)))
            .collect();
        if let Some(missing) = outputs.iter().find(|name| !produced.contains_key(name.as_str())) {
            return Err(DeployError::provisioning(
                stage,
                format!("declared output '{missing}' missing from deployment"),
                None,
            ));
        }

        info!(stage, outputs = produced.len(), declared = outputs.len(), "Resource template applied");
        Ok(StageResult::succeeded(stage, started, produced).with_fingerprint(params.fingerprint()))
    }

    async fn register_provider(&self, namespace: &str) -> Result<(), DeployError> {
        let spec = CommandSpec::new("az").args(["provider", "register", "--namespace", namespace, "--wait"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            warn!(namespace, exit_code = out.exit_code, "Provider registration failed");
            return Err(DeployError::provisioning(
                format!("provider:{namespace}"),
                out.diagnostic(),
                Some(out.exit_code),
            ));
        }
        info!(namespace, "Provider registered");
        Ok(())
    }

    async fn teardown(&self, target: &TargetEnvironment) -> Result<(), DeployError> {
        let spec = target.scoped(
            CommandSpec::new("az").args(["group", "delete", "--name", target.resource_group.as_str(), "--yes", "--no-wait"]),
        );
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(DeployError::provisioning("destroy", out.diagnostic(), Some(out.exit_code)));
        }
        info!(resource_group = %target.resource_group, "Teardown started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CommandOutput;
    use crate::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;

    fn target() -> TargetEnvironment {
        TargetEnvironment::new("alpha-rg", "eastus").with_subscription("sub-1")
    }

    fn deployment(outputs: serde_json::Value) -> CommandOutput {
        CommandOutput::ok(
            serde_json::json!({
                "properties": {"provisioningState": "Succeeded", "outputs": outputs}
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_provision_returns_declared_and_optional_outputs() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "az",
            &["deployment", "group", "create"],
            deployment(serde_json::json!({
                "clusterName": {"type": "String", "value": "alpha-aks"},
                "nodeCount": {"type": "Int", "value": 3},
                "registryName": {"type": "String", "value": "alphaacr"}
            })),
        ));
        let provisioner = AzCliProvisioner::new(runner.clone());
        let params = ParameterSet::new().with("prefix", "alpha");

        let result = provisioner
            .provision(
                "infra",
                Path::new("templates/main.json"),
                &params,
                &["clusterName".to_string(), "nodeCount".to_string()],
                &target(),
            )
            .await
            .unwrap();

        assert_eq!(result.output("clusterName"), Some("alpha-aks"));
        assert_eq!(result.output("nodeCount"), Some("3"));
        assert_eq!(result.output("registryName"), Some("alphaacr"));
        assert_eq!(result.fingerprint, Some(params.fingerprint()));

        let create = &runner.calls_matching("az", &["deployment", "group", "create"])[0];
        assert!(create.has_args(&["--parameters", "prefix=alpha"]));
        assert_eq!(create.flag_value("--subscription"), Some("sub-1"));
        let group_creates = runner
            .calls_matching("az", &["group", "create"])
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("group"))
            .count();
        assert_eq!(group_creates, 1);
    }

    #[tokio::test]
    async fn test_missing_declared_output_fails() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "az",
            &["deployment", "group", "create"],
            deployment(serde_json::json!({})),
        ));
        let provisioner = AzCliProvisioner::new(runner);

        let err = provisioner
            .provision(
                "infra",
                Path::new("t.json"),
                &ParameterSet::new(),
                &["clusterName".to_string()],
                &target(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::ProvisioningFailed { .. }));
        assert!(err.to_string().contains("clusterName"));
    }

    #[tokio::test]
    async fn test_rejected_template_propagates_exit_code() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "az",
            &["deployment", "group", "create"],
            CommandOutput::failed(3, "QuotaExceeded"),
        ));
        let provisioner = AzCliProvisioner::new(runner);

        let err = provisioner
            .provision("infra", Path::new("t.json"), &ParameterSet::new(), &[], &target())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("QuotaExceeded"));
    }

    #[tokio::test]
    async fn test_register_providers_fans_out() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "az",
            &["--namespace", "Microsoft.NetApp"],
            CommandOutput::failed(1, "not allowed"),
        ));
        let provisioner = AzCliProvisioner::new(runner.clone());
        let namespaces = vec![
            "Microsoft.ContainerService".to_string(),
            "Microsoft.NetApp".to_string(),
            "Microsoft.ContainerRegistry".to_string(),
        ];

        let failures = register_providers(&provisioner, &namespaces).await;

        assert_eq!(runner.calls_matching("az", &["provider", "register"]).len(), 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "Microsoft.NetApp");
    }

    #[tokio::test]
    async fn test_teardown_does_not_wait() {
        let runner = Arc::new(ScriptedRunner::new());
        let provisioner = AzCliProvisioner::new(runner.clone());

        provisioner.teardown(&target()).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].has_args(&["group", "delete", "--name", "alpha-rg", "--yes", "--no-wait"]));
    }
}
