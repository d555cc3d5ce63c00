//! Installing service units with `helm` and `kubectl`.

use super::command::{CommandRunner, CommandSpec};
use crate::context::StageContext;
use crate::core::{FailurePolicy, StageResult};
use crate::errors::DeployError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a unit's definition comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitSource {
    /// A packaged chart, optionally from a repository URL.
    Chart {
        /// Chart reference (`repo/name`, `oci://...`, or a bare name with `repo`).
        chart: String,
        /// Repository URL passed as `--repo`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
    },
    /// A raw manifest file applied as-is.
    Manifest {
        /// Manifest path.
        path: PathBuf,
    },
}

/// One installable service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Target namespace.
    pub namespace: String,
    /// Release name.
    pub release: String,
    /// Definition source.
    pub source: UnitSource,
    /// Values payload; string leaves may hold output references.
    #[serde(default)]
    pub values: serde_json::Value,
    /// Chart version pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// What a failure of this unit does to the run.
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Whether to wait for the release's resources to become ready.
    #[serde(default)]
    pub wait: bool,
}

impl ServiceUnit {
    /// Creates a chart unit.
    #[must_use]
    pub fn chart(namespace: impl Into<String>, release: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            release: release.into(),
            source: UnitSource::Chart {
                chart: chart.into(),
                repo: None,
            },
            values: serde_json::Value::Null,
            version: None,
            policy: FailurePolicy::Fatal,
            wait: false,
        }
    }

    /// Creates a manifest unit.
    #[must_use]
    pub fn manifest(namespace: impl Into<String>, release: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source: UnitSource::Manifest { path: path.into() },
            ..Self::chart(namespace, release, "")
        }
    }

    /// Sets the chart repository URL.
    #[must_use]
    pub fn with_repo(mut self, url: impl Into<String>) -> Self {
        if let UnitSource::Chart { repo, .. } = &mut self.source {
            *repo = Some(url.into());
        }
        self
    }

    /// Sets the values payload.
    #[must_use]
    pub fn with_values(mut self, values: serde_json::Value) -> Self {
        self.values = values;
        self
    }

    /// Pins the chart version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Waits for readiness on install.
    #[must_use]
    pub fn with_wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Returns `namespace/release`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.release)
    }
}

/// Installs or upgrades a single unit.
#[async_trait]
pub trait ServiceInstaller: Send + Sync {
    /// Installs `unit`, or upgrades it in place when already present.
    async fn install(&self, unit: &ServiceUnit) -> Result<(), DeployError>;
}

/// Outcome of applying a unit sequence.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// One result per attempted unit, in order.
    pub results: Vec<StageResult>,
    /// Tolerated unit failures.
    pub tolerated: Vec<(String, String)>,
    /// The fatal failure that stopped the sequence.
    pub fatal: Option<DeployError>,
}

impl ApplyReport {
    /// Returns true if no fatal failure occurred.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Applies `units` in order, one at a time.
///
/// A fatal failure stops the sequence; a tolerated failure is recorded and
/// the next unit runs.
pub async fn apply_units(installer: &dyn ServiceInstaller, units: &[ServiceUnit], ctx: &StageContext) -> ApplyReport {
    let mut report = ApplyReport::default();

    for unit in units {
        if let Some(reason) = ctx.cancellation().reason() {
            report.fatal = Some(DeployError::Cancelled(reason));
            break;
        }

        let id = unit.id();
        let started = Utc::now();
        ctx.emit("unit.started", serde_json::json!({"unit": id}));

        match installer.install(unit).await {
            Ok(()) => {
                ctx.emit("unit.installed", serde_json::json!({"unit": id}));
                report.results.push(StageResult::succeeded(&id, started, BTreeMap::new()));
            }
            Err(err) => {
                ctx.emit(
                    "unit.failed",
                    serde_json::json!({"unit": id, "policy": unit.policy, "error": err.to_string()}),
                );
                report.results.push(StageResult::failed(&id, started, err.to_string()));
                match unit.policy {
                    FailurePolicy::Tolerated => {
                        warn!(unit = %id, error = %err, "Tolerated unit failure");
                        report.tolerated.push((id, err.to_string()));
                    }
                    FailurePolicy::Fatal => {
                        report.fatal = Some(err);
                        break;
                    }
                }
            }
        }
    }

    report
}

/// [`ServiceInstaller`] using `helm upgrade --install` for charts and
/// `kubectl apply` for manifests.
#[derive(Clone)]
pub struct HelmInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl HelmInstaller {
    /// Creates an installer that runs tools through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn values_file(unit: &ServiceUnit) -> Result<Option<tempfile::NamedTempFile>, DeployError> {
        if unit.values.is_null() {
            return Ok(None);
        }
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-values-", unit.release))
            .suffix(".json")
            .tempfile()?;
        file.write_all(serde_json::to_vec_pretty(&unit.values)?.as_slice())?;
        file.flush()?;
        Ok(Some(file))
    }
}

impl fmt::Debug for HelmInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelmInstaller").finish_non_exhaustive()
    }
}

#[async_trait]
impl ServiceInstaller for HelmInstaller {
    async fn install(&self, unit: &ServiceUnit) -> Result<(), DeployError> {
        let values = Self::values_file(unit)?;

        let spec = match &unit.source {
            UnitSource::Chart { chart, repo } => {
                let mut spec = CommandSpec::new("helm")
                    .args(["upgrade", "--install", unit.release.as_str(), chart.as_str()])
                    .args(["--namespace", unit.namespace.as_str(), "--create-namespace"])
                    .opt("--repo", repo.as_deref())
                    .opt("--version", unit.version.as_deref());
                if let Some(file) = &values {
                    spec = spec.arg("-f").arg(file.path().display().to_string());
                }
                if unit.wait {
                    spec = spec.arg("--wait");
                }
                spec
            }
            UnitSource::Manifest { path } => CommandSpec::new("kubectl")
                .args(["apply", "--namespace", unit.namespace.as_str(), "-f"])
                .arg(path.display().to_string()),
        };

        info!(unit = %unit.id(), "Installing service unit");
        let out = self.runner.run(&spec).await?;
        // values file must outlive the command
        drop(values);

        if !out.success() {
            return Err(DeployError::install(unit.id(), out.diagnostic(), Some(out.exit_code)));
        }
        info!(unit = %unit.id(), "Service unit installed");
        Ok(())
    }
}
