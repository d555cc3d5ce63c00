//! Carrying credentials into the container platform.

use super::command::{CommandRunner, CommandSpec};
use super::provisioner::TargetEnvironment;
use crate::errors::DeployError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Secret material that never appears in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps secret material.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw material.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the material is empty or whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// The shape of a platform secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialKind {
    /// Image pull secret for a registry; the material is the password.
    DockerRegistry {
        /// Registry host.
        server: String,
        /// Registry user name.
        username: String,
    },
    /// Opaque secret storing the material under one key.
    Opaque {
        /// Data key.
        key: String,
    },
}

/// Creates or refreshes credentials inside the platform.
#[async_trait]
pub trait CredentialBridge: Send + Sync {
    /// Makes secret `name` in `namespace` hold `secret`.
    ///
    /// Creates the namespace when needed. Applying the same input twice
    /// yields the same end state.
    async fn ensure_credential(
        &self,
        name: &str,
        namespace: &str,
        kind: &CredentialKind,
        secret: &Secret,
    ) -> Result<(), DeployError>;
}

/// Builds the namespace and secret manifests for one credential.
#[must_use]
pub fn credential_manifest(name: &str, namespace: &str, kind: &CredentialKind, secret: &Secret) -> serde_json::Value {
    let (secret_type, data) = match kind {
        CredentialKind::DockerRegistry { server, username } => {
            let auth = BASE64.encode(format!("{username}:{}", secret.expose()));
            let config = json!({
                "auths": {
                    server: {
                        "username": username,
                        "password": secret.expose(),
                        "auth": auth,
                    }
                }
            });
            (
                "kubernetes.io/dockerconfigjson",
                json!({ ".dockerconfigjson": BASE64.encode(config.to_string()) }),
            )
        }
        CredentialKind::Opaque { key } => ("Opaque", json!({ key: BASE64.encode(secret.expose()) })),
    };

    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": namespace },
            },
            {
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "name": name,
                    "namespace": namespace,
                    "labels": { "app.kubernetes.io/managed-by": "deployflow" },
                },
                "type": secret_type,
                "data": data,
            }
        ]
    })
}

/// [`CredentialBridge`] backed by `kubectl apply`.
#[derive(Clone)]
pub struct KubectlCredentialBridge {
    runner: Arc<dyn CommandRunner>,
}

impl KubectlCredentialBridge {
    /// Creates a bridge that runs `kubectl` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl fmt::Debug for KubectlCredentialBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubectlCredentialBridge").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialBridge for KubectlCredentialBridge {
    async fn ensure_credential(
        &self,
        name: &str,
        namespace: &str,
        kind: &CredentialKind,
        secret: &Secret,
    ) -> Result<(), DeployError> {
        let manifest = credential_manifest(name, namespace, kind, secret);
        let spec = CommandSpec::new("kubectl")
            .args(["apply", "-f", "-"])
            .stdin(manifest.to_string());

        debug!(name, namespace, "Applying credential");
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(DeployError::CredentialRejected {
                name: name.to_string(),
                namespace: namespace.to_string(),
                cause: out.diagnostic(),
                exit_code: Some(out.exit_code),
            });
        }
        info!(name, namespace, "Credential in place");
        Ok(())
    }
}

/// Access to the provisioned cluster.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Writes credentials for `cluster` into the local kube config.
    async fn fetch_credentials(&self, cluster: &str, target: &TargetEnvironment) -> Result<(), DeployError>;

    /// Grants `cluster` pull access to `registry`.
    async fn attach_registry(&self, cluster: &str, registry: &str, target: &TargetEnvironment) -> Result<(), DeployError>;
}

/// [`ClusterAccess`] backed by `az aks`.
#[derive(Clone)]
pub struct AzCliClusterAccess {
    runner: Arc<dyn CommandRunner>,
}

impl AzCliClusterAccess {
    /// Creates cluster access that runs `az` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn aks(&self, cluster: &str, spec: CommandSpec, target: &TargetEnvironment) -> Result<(), DeployError> {
        let spec = spec
            .args(["--resource-group", target.resource_group.as_str(), "--name", cluster])
            .opt("--subscription", target.subscription.as_deref());
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(DeployError::provisioning(
                format!("aks:{cluster}"),
                out.diagnostic(),
                Some(out.exit_code),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for AzCliClusterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzCliClusterAccess").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterAccess for AzCliClusterAccess {
    async fn fetch_credentials(&self, cluster: &str, target: &TargetEnvironment) -> Result<(), DeployError> {
        let spec = CommandSpec::new("az").args(["aks", "get-credentials", "--overwrite-existing"]);
        self.aks(cluster, spec, target).await?;
        info!(cluster, "Cluster credentials fetched");
        Ok(())
    }

    async fn attach_registry(&self, cluster: &str, registry: &str, target: &TargetEnvironment) -> Result<(), DeployError> {
        let spec = CommandSpec::new("az").args(["aks", "update", "--attach-acr", registry]);
        self.aks(cluster, spec, target).await?;
        info!(cluster, registry, "Registry attached");
        Ok(())
    }
}
