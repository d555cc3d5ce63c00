//! In-process fakes for the platform adapters.
//!
//! Every fake appends to a shared [`CallLog`] so tests can assert on the
//! order of external calls across adapters.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::ScriptedRunner;
use crate::core::{ParameterSet, StageResult};
use crate::errors::DeployError;
use crate::orchestrator::Collaborators;
use crate::platform::{
    BatchJobRunner, ClusterAccess, CredentialBridge, CredentialKind, JobBackend, JobPhase, JobSpec,
    ResourceProvisioner, Secret, ServiceInstaller, ServiceUnit, StatusReporter, TargetEnvironment,
};

/// Ordered record of external calls shared by the fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    /// Returns every entry in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Returns the number of entries starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Returns the index of the first entry equal to `entry`.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    /// Returns true if nothing was called.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// A provisioner returning configured outputs.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    log: CallLog,
    outputs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    failures: Mutex<HashMap<String, (String, i32)>>,
    params: Mutex<HashMap<String, ParameterSet>>,
}

impl FakeProvisioner {
    /// Creates a provisioner logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Sets the outputs returned for `stage`.
    pub fn set_outputs<I, K, V>(&self, stage: &str, outputs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let outputs = outputs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.outputs.lock().insert(stage.to_string(), outputs);
    }

    /// Makes `target` fail with `cause` and exit status `code`.
    ///
    /// `target` is a stage name or a provider namespace.
    pub fn fail(&self, target: &str, cause: &str, code: i32) {
        self.failures
            .lock()
            .insert(target.to_string(), (cause.to_string(), code));
    }

    /// Returns the parameters `stage` was provisioned with.
    #[must_use]
    pub fn params_for(&self, stage: &str) -> Option<ParameterSet> {
        self.params.lock().get(stage).cloned()
    }

    fn failure(&self, stage: &str, target: &str) -> Option<DeployError> {
        self.failures
            .lock()
            .get(target)
            .map(|(cause, code)| DeployError::provisioning(stage, cause, Some(*code)))
    }
}

#[async_trait]
impl ResourceProvisioner for FakeProvisioner {
    async fn provision(
        &self,
        stage: &str,
        _template: &Path,
        params: &ParameterSet,
        outputs: &[String],
        _target: &TargetEnvironment,
    ) -> Result<StageResult, DeployError> {
        self.log.push(format!("provision:{stage}"));
        self.params.lock().insert(stage.to_string(), params.clone());
        if let Some(err) = self.failure(stage, stage) {
            return Err(err);
        }
        let produced = self.outputs.lock().get(stage).cloned().unwrap_or_default();
        if let Some(missing) = outputs.iter().find(|o| !produced.contains_key(*o)) {
            return Err(DeployError::provisioning(
                stage,
                format!("declared output '{missing}' missing"),
                None,
            ));
        }
        Ok(StageResult::succeeded(stage, Utc::now(), produced))
    }

    async fn register_provider(&self, namespace: &str) -> Result<(), DeployError> {
        self.log.push(format!("register:{namespace}"));
        self.failure("providers", namespace).map_or(Ok(()), Err)
    }

    async fn teardown(&self, target: &TargetEnvironment) -> Result<(), DeployError> {
        self.log.push(format!("teardown:{}", target.resource_group));
        Ok(())
    }
}

/// Cluster access that only records calls.
#[derive(Debug, Default)]
pub struct FakeClusterAccess {
    log: CallLog,
    attach_failure: Mutex<Option<String>>,
}

impl FakeClusterAccess {
    /// Creates a fake logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            attach_failure: Mutex::new(None),
        }
    }

    /// Makes registry attachment fail.
    pub fn fail_attach(&self, cause: &str) {
        *self.attach_failure.lock() = Some(cause.to_string());
    }
}

#[async_trait]
impl ClusterAccess for FakeClusterAccess {
    async fn fetch_credentials(&self, cluster: &str, _target: &TargetEnvironment) -> Result<(), DeployError> {
        self.log.push(format!("connect:{cluster}"));
        Ok(())
    }

    async fn attach_registry(&self, cluster: &str, registry: &str, _target: &TargetEnvironment) -> Result<(), DeployError> {
        self.log.push(format!("attach:{cluster}:{registry}"));
        match self.attach_failure.lock().clone() {
            Some(cause) => Err(DeployError::provisioning(format!("aks:{cluster}"), cause, Some(1))),
            None => Ok(()),
        }
    }
}

/// A credential bridge keeping the applied secrets in memory.
#[derive(Debug, Default)]
pub struct FakeCredentialBridge {
    log: CallLog,
    secrets: Mutex<BTreeMap<String, (CredentialKind, Secret)>>,
    reject: Mutex<Option<String>>,
}

impl FakeCredentialBridge {
    /// Creates a fake logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            secrets: Mutex::new(BTreeMap::new()),
            reject: Mutex::new(None),
        }
    }

    /// Makes every write fail with `cause`.
    pub fn reject(&self, cause: &str) {
        *self.reject.lock() = Some(cause.to_string());
    }

    /// Returns `namespace/name` of every stored secret.
    #[must_use]
    pub fn secret_ids(&self) -> Vec<String> {
        self.secrets.lock().keys().cloned().collect()
    }

    /// Returns the material stored for `namespace/name`.
    #[must_use]
    pub fn material(&self, id: &str) -> Option<String> {
        self.secrets.lock().get(id).map(|(_, s)| s.expose().to_string())
    }
}

#[async_trait]
impl CredentialBridge for FakeCredentialBridge {
    async fn ensure_credential(
        &self,
        name: &str,
        namespace: &str,
        kind: &CredentialKind,
        secret: &Secret,
    ) -> Result<(), DeployError> {
        self.log.push(format!("credential:{namespace}/{name}"));
        if let Some(cause) = self.reject.lock().clone() {
            return Err(DeployError::CredentialRejected {
                name: name.to_string(),
                namespace: namespace.to_string(),
                cause,
                exit_code: Some(1),
            });
        }
        self.secrets
            .lock()
            .insert(format!("{namespace}/{name}"), (kind.clone(), secret.clone()));
        Ok(())
    }
}

/// An installer keeping installed units in memory.
#[derive(Debug, Default)]
pub struct FakeInstaller {
    log: CallLog,
    installed: Mutex<BTreeMap<String, serde_json::Value>>,
    failures: Mutex<HashMap<String, (String, i32)>>,
}

impl FakeInstaller {
    /// Creates a fake logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Makes unit `id` (`namespace/release`) fail.
    pub fn fail(&self, id: &str, cause: &str, code: i32) {
        self.failures
            .lock()
            .insert(id.to_string(), (cause.to_string(), code));
    }

    /// Returns the ids of installed units.
    #[must_use]
    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().keys().cloned().collect()
    }

    /// Returns the values payload a unit was installed with.
    #[must_use]
    pub fn values(&self, id: &str) -> Option<serde_json::Value> {
        self.installed.lock().get(id).cloned()
    }
}

#[async_trait]
impl ServiceInstaller for FakeInstaller {
    async fn install(&self, unit: &ServiceUnit) -> Result<(), DeployError> {
        let id = unit.id();
        self.log.push(format!("install:{id}"));
        if let Some((cause, code)) = self.failures.lock().get(&id).cloned() {
            return Err(DeployError::install(id, cause, Some(code)));
        }
        self.installed.lock().insert(id, unit.values.clone());
        Ok(())
    }
}

/// A job backend replaying a scripted phase sequence.
///
/// The last phase repeats once the script is exhausted.
#[derive(Debug)]
pub struct FakeJobBackend {
    log: CallLog,
    phases: Mutex<Vec<JobPhase>>,
    submitted: Mutex<Vec<JobSpec>>,
}

impl FakeJobBackend {
    /// Creates a backend whose jobs succeed on the first poll.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            phases: Mutex::new(vec![JobPhase::Succeeded]),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the phase script.
    pub fn set_phases(&self, phases: Vec<JobPhase>) {
        *self.phases.lock() = phases;
    }

    /// Returns the submitted jobs.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl JobBackend for FakeJobBackend {
    async fn submit(&self, job: &JobSpec) -> Result<(), DeployError> {
        self.log.push(format!("submit:{}", job.name));
        self.submitted.lock().push(job.clone());
        Ok(())
    }

    async fn phase(&self, _job: &JobSpec) -> Result<JobPhase, DeployError> {
        let mut phases = self.phases.lock();
        let phase = phases.first().cloned().unwrap_or(JobPhase::Running);
        if phases.len() > 1 {
            phases.remove(0);
        }
        Ok(phase)
    }
}

/// Every fake wired together behind one call log.
#[derive(Debug, Clone)]
pub struct FakePlatform {
    /// The shared call log.
    pub log: CallLog,
    /// Provisioner fake.
    pub provisioner: Arc<FakeProvisioner>,
    /// Cluster access fake.
    pub cluster: Arc<FakeClusterAccess>,
    /// Credential bridge fake.
    pub credentials: Arc<FakeCredentialBridge>,
    /// Installer fake.
    pub installer: Arc<FakeInstaller>,
    /// Job backend fake.
    pub jobs: Arc<FakeJobBackend>,
    /// Runner behind the status reporter.
    pub runner: Arc<ScriptedRunner>,
}

impl FakePlatform {
    /// Creates a platform where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        let log = CallLog::new();
        Self {
            provisioner: Arc::new(FakeProvisioner::new(log.clone())),
            cluster: Arc::new(FakeClusterAccess::new(log.clone())),
            credentials: Arc::new(FakeCredentialBridge::new(log.clone())),
            installer: Arc::new(FakeInstaller::new(log.clone())),
            jobs: Arc::new(FakeJobBackend::new(log.clone())),
            runner: Arc::new(ScriptedRunner::default()),
            log,
        }
    }

    /// Builds orchestrator collaborators over the fakes.
    #[must_use]
    pub fn collaborators(&self, poll_interval: Duration) -> Collaborators {
        Collaborators {
            provisioner: self.provisioner.clone(),
            cluster: self.cluster.clone(),
            credentials: self.credentials.clone(),
            installer: self.installer.clone(),
            jobs: BatchJobRunner::new(self.jobs.clone(), poll_interval),
            status: StatusReporter::new(self.runner.clone()),
        }
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}
