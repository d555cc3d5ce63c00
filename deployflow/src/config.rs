//! Deployment configuration.
//!
//! Values start from [`DeployConfig::default`], are overlaid by an optional
//! JSON file and finally by the process environment. The API key is only
//! ever read from the environment and is never serialized.

use crate::errors::DeployError;
use crate::platform::{Secret, TargetEnvironment};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// API key used for the model registry and the inference services.
pub const API_KEY_VAR: &str = "NGC_API_KEY";
/// Path of a JSON file supplying configuration defaults.
pub const CONFIG_VAR: &str = "DEPLOYFLOW_CONFIG";
/// Region override.
pub const REGION_VAR: &str = "AZURE_LOCATION";
/// Naming prefix override.
pub const PREFIX_VAR: &str = "DEPLOY_PREFIX";
/// Resource group override.
pub const RESOURCE_GROUP_VAR: &str = "AZURE_RESOURCE_GROUP";
/// Subscription override.
pub const SUBSCRIPTION_VAR: &str = "AZURE_SUBSCRIPTION_ID";
/// State directory override.
pub const STATE_DIR_VAR: &str = "DEPLOYFLOW_STATE_DIR";
/// Data-load job bound override, in seconds.
pub const JOB_TIMEOUT_VAR: &str = "DEPLOYFLOW_JOB_TIMEOUT_SECS";

/// Configuration for one deployment environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Naming prefix for every created resource.
    pub prefix: String,
    /// Region for the resource group.
    pub region: String,
    /// Defaults to `<prefix>-rg`.
    pub resource_group: Option<String>,
    /// Subscription id; the CLI default when absent.
    pub subscription: Option<String>,
    /// Where run state is persisted.
    pub state_dir: PathBuf,
    /// Resource template for network, storage and compute.
    pub template: PathBuf,
    /// Directory holding the workload manifests.
    pub manifests_dir: PathBuf,
    /// Namespace of the agent workload.
    pub app_namespace: String,
    /// Namespace of the inference services.
    pub ai_namespace: String,
    /// Namespace of the vector database.
    pub data_namespace: String,
    /// Namespace of the GPU operator.
    pub operator_namespace: String,
    /// Capability providers registered before provisioning.
    pub providers: Vec<String>,
    /// Append the data-load stage to `deploy`.
    pub load_data_on_deploy: bool,
    /// Data-load job bound.
    pub job_timeout_secs: u64,
    /// Job polling interval.
    pub poll_interval_secs: u64,
    /// Identifiers handed to the data-load job.
    pub tickers: Vec<String>,
    /// Image of the data-load job. May reference stage outputs.
    pub loader_image: String,
    /// Volume claim mounted into the data-load job.
    pub data_claim: String,
    /// Mount path of the claim.
    pub data_mount_path: String,
    /// Set from `NGC_API_KEY` only.
    #[serde(skip)]
    pub api_key: Option<Secret>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            prefix: "alpha".to_string(),
            region: "eastus".to_string(),
            resource_group: None,
            subscription: None,
            state_dir: PathBuf::from(".deployflow"),
            template: PathBuf::from("infra/main.bicep"),
            manifests_dir: PathBuf::from("k8s"),
            app_namespace: "alpha".to_string(),
            ai_namespace: "nim".to_string(),
            data_namespace: "milvus".to_string(),
            operator_namespace: "gpu-operator".to_string(),
            providers: [
                "Microsoft.ContainerService",
                "Microsoft.ContainerRegistry",
                "Microsoft.NetApp",
                "Microsoft.Network",
                "Microsoft.Storage",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            load_data_on_deploy: false,
            job_timeout_secs: 1800,
            poll_interval_secs: 10,
            tickers: vec!["AAPL".to_string(), "MSFT".to_string(), "TSLA".to_string()],
            loader_image: "${infra.registryServer}/alpha-agent:latest".to_string(),
            data_claim: "anf-data".to_string(),
            data_mount_path: "/mnt/anf/data".to_string(),
            api_key: None,
        }
    }
}

impl DeployConfig {
    /// Loads configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| DeployError::InvalidConfig {
            reason: format!("Failed to read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| DeployError::InvalidConfig {
            reason: format!("Failed to parse {}: {e}", path.display()),
        })
    }

    /// Loads configuration from the process environment.
    pub fn from_env(file: Option<&Path>) -> Result<Self, DeployError> {
        Self::from_lookup(file, |name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which stands in for the
    /// environment.
    ///
    /// `file` takes precedence over the file named by `DEPLOYFLOW_CONFIG`.
    pub fn from_lookup<F>(file: Option<&Path>, lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let named = lookup(CONFIG_VAR).map(PathBuf::from);
        let mut config = match file.map(Path::to_path_buf).or(named) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        if let Some(region) = lookup(REGION_VAR) {
            config.region = region;
        }
        if let Some(prefix) = lookup(PREFIX_VAR) {
            config.prefix = prefix;
        }
        if let Some(group) = lookup(RESOURCE_GROUP_VAR) {
            config.resource_group = Some(group);
        }
        if let Some(subscription) = lookup(SUBSCRIPTION_VAR) {
            config.subscription = Some(subscription);
        }
        if let Some(dir) = lookup(STATE_DIR_VAR) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(JOB_TIMEOUT_VAR) {
            config.job_timeout_secs = secs.trim().parse().map_err(|_| DeployError::InvalidConfig {
                reason: format!("{JOB_TIMEOUT_VAR} must be a number of seconds, got '{secs}'"),
            })?;
        }
        config.api_key = lookup(API_KEY_VAR).map(Secret::new);

        Ok(config)
    }

    /// Returns the resource group, falling back to `<prefix>-rg`.
    #[must_use]
    pub fn resource_group(&self) -> String {
        self.resource_group
            .clone()
            .unwrap_or_else(|| format!("{}-rg", self.prefix))
    }

    /// Returns the provisioning target.
    #[must_use]
    pub fn target(&self) -> TargetEnvironment {
        let target = TargetEnvironment::new(self.resource_group(), &self.region);
        match &self.subscription {
            Some(subscription) => target.with_subscription(subscription),
            None => target,
        }
    }

    /// Returns the API key when it is set and not blank.
    #[must_use]
    pub fn api_key(&self) -> Option<&Secret> {
        self.api_key.as_ref().filter(|k| !k.is_blank())
    }

    /// Returns the data-load job bound.
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns the job polling interval, at least one second.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
