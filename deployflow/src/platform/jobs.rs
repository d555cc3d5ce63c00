//! One-shot batch workloads.
//!
//! A job is submitted once, polled until it reaches a terminal phase and then
//! left alone. A job that outlives its bound is reported as timed out and
//! keeps running in the platform.

use super::command::{CommandRunner, CommandSpec};
use crate::context::StageContext;
use crate::core::StageResult;
use crate::errors::DeployError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_mount_path() -> String {
    "/mnt/data".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

/// A one-shot containerised workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name.
    pub name: String,
    /// Namespace the job runs in.
    pub namespace: String,
    /// Container image.
    pub image: String,
    /// Command and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment; values may hold output references.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Persistent volume claim mounted into the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
    /// Where the claim is mounted.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    /// Image pull secret name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
    /// Secret whose keys are exposed as environment variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from_secret: Option<String>,
    /// Completion bound in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl JobSpec {
    /// Creates a job with the default mount path and bound.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            claim: None,
            mount_path: default_mount_path(),
            pull_secret: None,
            env_from_secret: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mounts `claim` at `mount_path`.
    #[must_use]
    pub fn with_volume(mut self, claim: impl Into<String>, mount_path: impl Into<String>) -> Self {
        self.claim = Some(claim.into());
        self.mount_path = mount_path.into();
        self
    }

    /// Sets the image pull secret.
    #[must_use]
    pub fn with_pull_secret(mut self, name: impl Into<String>) -> Self {
        self.pull_secret = Some(name.into());
        self
    }

    /// Exposes the keys of secret `name` as environment variables.
    #[must_use]
    pub fn with_env_from_secret(mut self, name: impl Into<String>) -> Self {
        self.env_from_secret = Some(name.into());
        self
    }

    /// Sets the completion bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Returns the completion bound.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Renders the batch/v1 Job manifest.
    #[must_use]
    pub fn manifest(&self) -> serde_json::Value {
        let env: Vec<_> = self
            .env
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        let mut container = json!({
            "name": self.name,
            "image": self.image,
            "env": env,
        });
        let mut pod = json!({
            "restartPolicy": "Never",
            "containers": [],
        });

        if !self.command.is_empty() {
            container["command"] = json!(self.command);
        }
        if let Some(secret) = &self.env_from_secret {
            container["envFrom"] = json!([{"secretRef": {"name": secret}}]);
        }
        if let Some(claim) = &self.claim {
            container["volumeMounts"] = json!([{"name": "data", "mountPath": self.mount_path}]);
            pod["volumes"] = json!([{"name": "data", "persistentVolumeClaim": {"claimName": claim}}]);
        }
        if let Some(secret) = &self.pull_secret {
            pod["imagePullSecrets"] = json!([{"name": secret}]);
        }
        pod["containers"] = json!([container]);

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": {"app.kubernetes.io/managed-by": "deployflow"},
            },
            "spec": {
                "backoffLimit": 0,
                "template": {"spec": pod},
            }
        })
    }
}

/// Observed phase of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum JobPhase {
    /// Accepted, no pod active yet.
    Submitted,
    /// A pod is active.
    Running,
    /// Finished with exit status zero.
    Succeeded,
    /// Finished unsuccessfully.
    Failed(String),
}

impl JobPhase {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Submits jobs and reports their phase.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submits `job`, replacing a finished job of the same name.
    ///
    /// A job of the same name that is still active is left alone and the
    /// submission fails.
    async fn submit(&self, job: &JobSpec) -> Result<(), DeployError>;

    /// Returns the current phase of `job`.
    async fn phase(&self, job: &JobSpec) -> Result<JobPhase, DeployError>;
}

#[derive(Debug, Default, Deserialize)]
struct JobStatus {
    #[serde(default)]
    active: u32,
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobObject {
    #[serde(default)]
    status: JobStatus,
}

fn phase_of(status: &JobStatus) -> JobPhase {
    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .find(|c| c.kind == kind && c.status == "True")
    };
    if condition("Complete").is_some() || status.succeeded > 0 {
        return JobPhase::Succeeded;
    }
    if let Some(c) = condition("Failed") {
        let reason = c
            .message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_else(|| "job failed".to_string());
        return JobPhase::Failed(reason);
    }
    if status.failed > 0 {
        return JobPhase::Failed(format!("{} pod(s) failed", status.failed));
    }
    if status.active > 0 {
        JobPhase::Running
    } else {
        JobPhase::Submitted
    }
}

/// [`JobBackend`] backed by `kubectl`.
#[derive(Clone)]
pub struct KubectlJobBackend {
    runner: Arc<dyn CommandRunner>,
}

impl KubectlJobBackend {
    /// Creates a backend that runs `kubectl` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn job_error(job: &JobSpec, cause: String) -> DeployError {
        DeployError::JobFailed {
            job: job.name.clone(),
            cause,
        }
    }
}

impl fmt::Debug for KubectlJobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubectlJobBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobBackend for KubectlJobBackend {
    async fn submit(&self, job: &JobSpec) -> Result<(), DeployError> {
        let lookup = CommandSpec::new("kubectl")
            .args(["get", "job", job.name.as_str(), "--namespace", job.namespace.as_str()])
            .args(["--ignore-not-found", "--output", "json"]);
        let out = self.runner.run(&lookup).await?;
        if !out.success() {
            return Err(Self::job_error(job, out.diagnostic()));
        }

        if !out.stdout.trim().is_empty() {
            let previous: JobObject = out.json("kubectl")?;
            let phase = phase_of(&previous.status);
            if !phase.is_terminal() {
                warn!(job = %job.name, phase = %phase, "Previous job still active; not replacing it");
                return Err(Self::job_error(
                    job,
                    format!("a previous run of this job is still {phase}; delete it explicitly before resubmitting"),
                ));
            }

            debug!(job = %job.name, phase = %phase, "Removing finished job before resubmitting");
            let delete = CommandSpec::new("kubectl")
                .args(["delete", "job", job.name.as_str(), "--namespace", job.namespace.as_str()])
                .args(["--ignore-not-found", "--wait=true"]);
            let out = self.runner.run(&delete).await?;
            if !out.success() {
                return Err(Self::job_error(job, out.diagnostic()));
            }
        }

        let apply = CommandSpec::new("kubectl")
            .args(["apply", "-f", "-"])
            .stdin(job.manifest().to_string());
        let out = self.runner.run(&apply).await?;
        if !out.success() {
            return Err(Self::job_error(job, out.diagnostic()));
        }
        Ok(())
    }

    async fn phase(&self, job: &JobSpec) -> Result<JobPhase, DeployError> {
        let spec = CommandSpec::new("kubectl")
            .args(["get", "job", job.name.as_str(), "--namespace", job.namespace.as_str()])
            .args(["--output", "json"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(Self::job_error(job, out.diagnostic()));
        }
        let object: JobObject = out.json("kubectl")?;
        Ok(phase_of(&object.status))
    }
}

/// Runs jobs to completion with a bounded, cancellable wait.
#[derive(Clone)]
pub struct BatchJobRunner {
    backend: Arc<dyn JobBackend>,
    poll_interval: Duration,
}

impl BatchJobRunner {
    /// Creates a runner polling every `poll_interval`.
    #[must_use]
    pub fn new(backend: Arc<dyn JobBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
        }
    }

    /// Submits `job` and waits for a terminal phase.
    ///
    /// Returns `JobTimedOut` once the job's bound elapses, `JobFailed` when
    /// the job fails, and `Cancelled` when the run is cancelled mid-wait.
    pub async fn run_to_completion(&self, job: &JobSpec, ctx: &StageContext) -> Result<StageResult, DeployError> {
        let started = Utc::now();
        self.backend.submit(job).await?;
        info!(job = %job.name, namespace = %job.namespace, timeout_secs = job.timeout_secs, "Job submitted");
        ctx.emit("job.submitted", json!({"job": job.name, "timeout_secs": job.timeout_secs}));

        let wait = self.wait_terminal(job, ctx);
        let outcome = tokio::select! {
            bounded = tokio::time::timeout(job.timeout(), wait) => match bounded {
                Ok(result) => result,
                Err(_) => {
                    warn!(job = %job.name, "Job did not finish in time; leaving it running");
                    ctx.emit("job.timed_out", json!({"job": job.name, "waited_secs": job.timeout_secs}));
                    Err(DeployError::JobTimedOut {
                        job: job.name.clone(),
                        waited_secs: job.timeout_secs,
                    })
                }
            },
            () = ctx.cancellation().cancelled() => Err(DeployError::Cancelled(
                ctx.cancellation().reason().unwrap_or_default(),
            )),
        };

        outcome.map(|()| StageResult::succeeded(ctx.stage_name(), started, BTreeMap::new()))
    }

    async fn wait_terminal(&self, job: &JobSpec, ctx: &StageContext) -> Result<(), DeployError> {
        let mut last = JobPhase::Submitted;
        loop {
            let phase = self.backend.phase(job).await?;
            if phase != last {
                debug!(job = %job.name, phase = %phase, "Job phase changed");
                ctx.emit("job.phase", json!({"job": job.name, "phase": phase.to_string()}));
                last = phase.clone();
            }
            match phase {
                JobPhase::Succeeded => return Ok(()),
                JobPhase::Failed(cause) => {
                    return Err(DeployError::JobFailed {
                        job: job.name.clone(),
                        cause,
                    })
                }
                JobPhase::Submitted | JobPhase::Running => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

impl fmt::Debug for BatchJobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchJobRunner")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
