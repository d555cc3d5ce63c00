//! The bring-up orchestrator.
//!
//! [`Orchestrator::run`] walks a [`StageGraph`] in execution order. For each
//! stage it:
//!
//! 1. skips the stage when the store already holds a succeeded result
//! 2. checks that every dependency succeeded (or was skipped)
//! 3. resolves parameters and payloads against the [`OutputStore`]
//! 4. evaluates the stage gate, then the required parameters
//! 5. executes the action and persists the [`StageResult`]
//!
//! A fatal failure halts the run in `Failed(stage)`. Nothing is rolled back.

#[cfg(test)]
mod orchestrator_tests;
mod plan;

pub use plan::{
    pipeline, AI_TIER_STAGE, ATTACH_REGISTRY_STAGE, CREDENTIALS_STAGE, DATA_TIER_STAGE, INFRA_STAGE,
    KUBE_CONTEXT_STAGE, LOAD_DATA_STAGE, OPERATOR_STAGE, PROVIDERS_STAGE, WORKLOAD_STAGE,
};

use crate::cancellation::CancellationToken;
use crate::config::{DeployConfig, API_KEY_VAR};
use crate::context::{RunIdentity, StageContext};
use crate::core::{FailurePolicy, ParameterSet, StageResult, StageStatus};
use crate::errors::{DeployError, UnresolvedReferenceError};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{CredentialSpec, FailureRecord, RunSummary, SecretSource, StageAction, StageGraph, StageSpec};
use crate::platform::{
    apply_units, register_providers, AzCliClusterAccess, AzCliProvisioner, BatchJobRunner, ClusterAccess,
    CommandRunner, CredentialBridge, CredentialKind, HelmInstaller, KubectlCredentialBridge, KubectlJobBackend,
    ResourceProvisioner, Secret, ServiceInstaller, ServiceUnit, StatusReporter, StatusSnapshot, TargetEnvironment,
};
use crate::store::OutputStore;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[cfg(feature = "probe")]
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The adapters a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Resource templates and provider registration.
    pub provisioner: Arc<dyn ResourceProvisioner>,
    /// Cluster credentials and registry attachment.
    pub cluster: Arc<dyn ClusterAccess>,
    /// Platform secrets.
    pub credentials: Arc<dyn CredentialBridge>,
    /// Service units.
    pub installer: Arc<dyn ServiceInstaller>,
    /// Batch jobs.
    pub jobs: BatchJobRunner,
    /// Readiness snapshots.
    pub status: StatusReporter,
}

impl Collaborators {
    /// Wires the CLI-backed adapters over one command runner.
    #[must_use]
    pub fn from_runner(runner: Arc<dyn CommandRunner>, poll_interval: Duration) -> Self {
        Self {
            provisioner: Arc::new(AzCliProvisioner::new(runner.clone())),
            cluster: Arc::new(AzCliClusterAccess::new(runner.clone())),
            credentials: Arc::new(KubectlCredentialBridge::new(runner.clone())),
            installer: Arc::new(HelmInstaller::new(runner.clone())),
            jobs: BatchJobRunner::new(Arc::new(KubectlJobBackend::new(runner.clone())), poll_interval),
            status: StatusReporter::new(runner),
        }
    }

    /// Replaces the provisioner.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

/// A run that stopped before completing.
#[derive(Debug)]
pub struct RunError {
    /// The stage that failed; `None` when the run never started.
    pub stage: Option<String>,
    /// The failure.
    pub source: DeployError,
    /// Everything recorded up to the failure.
    pub summary: Box<RunSummary>,
}

impl RunError {
    fn before_start(run_id: &str, source: DeployError) -> Self {
        Self {
            stage: None,
            source,
            summary: Box::new(RunSummary::new(run_id)),
        }
    }

    /// Returns the process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "Stage '{stage}' failed: {}", self.source),
            None => write!(f, "{}", self.source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Read-only view of the latest run and the platform.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Run that `latest.json` points at.
    pub run_id: Option<String>,
    /// Status of every stage recorded in that run.
    pub stages: BTreeMap<String, StageStatus>,
    /// Platform units.
    pub units: StatusSnapshot,
}

enum Prepared {
    Skip(String),
    Ready { params: ParameterSet, action: StageAction },
}

#[derive(Default)]
struct Execution {
    outputs: BTreeMap<String, String>,
    units: Vec<StageResult>,
    tolerated: Vec<(String, String)>,
    error: Option<DeployError>,
}

impl Execution {
    fn from_result(result: Result<(), DeployError>) -> Self {
        Self {
            error: result.err(),
            ..Self::default()
        }
    }
}

struct StageOutcome {
    result: StageResult,
    tolerated: Vec<FailureRecord>,
    error: Option<DeployError>,
}

/// Drives runs, status queries and teardown for one environment.
pub struct Orchestrator {
    config: DeployConfig,
    collaborators: Collaborators,
    cancel: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            cancel: Arc::new(CancellationToken::new()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Runs the full bring-up.
    ///
    /// Passing the id of an earlier run resumes it: stages that already
    /// succeeded are not executed again.
    #[instrument(skip(self))]
    pub async fn deploy(&self, run_id: Option<String>) -> Result<RunSummary, RunError> {
        let run = match run_id {
            Some(id) if !RunIdentity::is_valid_run_id(&id) => {
                return Err(RunError::before_start(
                    &id,
                    DeployError::InvalidConfig {
                        reason: format!("invalid run id '{id}'"),
                    },
                ))
            }
            Some(id) => RunIdentity::with_run_id(id),
            None => RunIdentity::new(),
        };

        if self.config.api_key().is_none() {
            error!(variable = API_KEY_VAR, "Required secret is not set");
            return Err(RunError::before_start(&run.run_id, DeployError::precondition(API_KEY_VAR)));
        }

        let graph = plan::pipeline(&self.config, self.config.load_data_on_deploy)
            .map_err(|e| RunError::before_start(&run.run_id, e.into()))?;
        let run_id = run.run_id.clone();
        let store = OutputStore::open(&self.config.state_dir, run).map_err(|e| RunError::before_start(&run_id, e))?;

        self.run(&graph, &store).await
    }

    /// Runs the data-load stage against the latest provisioned run.
    ///
    /// Upstream results are copied into a fresh run, so only stages that
    /// never succeeded are executed.
    #[instrument(skip(self))]
    pub async fn load_data(&self) -> Result<RunSummary, RunError> {
        let run = RunIdentity::new();
        let run_id = run.run_id.clone();
        let fail = |e: DeployError| RunError::before_start(&run_id, e);

        let latest = OutputStore::open_latest(&self.config.state_dir)
            .map_err(fail)?
            .ok_or_else(|| fail(DeployError::precondition("provisioned run state (run `deploy` first)")))?;
        let graph = plan::pipeline(&self.config, true)
            .and_then(|g| g.subgraph(LOAD_DATA_STAGE))
            .map_err(|e| fail(e.into()))?;

        let upstream: Vec<&str> = graph
            .execution_order()
            .iter()
            .map(String::as_str)
            .filter(|s| *s != LOAD_DATA_STAGE)
            .collect();
        let store = latest.fork(run, &upstream).map_err(fail)?;

        self.run(&graph, &store).await
    }

    /// Returns the latest run's stage statuses and a platform snapshot.
    pub async fn status(&self, probe: bool) -> Result<StatusReport, DeployError> {
        let latest = OutputStore::open_latest(&self.config.state_dir)?;
        let (run_id, stages) = match &latest {
            Some(store) => {
                let stages = store
                    .results()
                    .iter()
                    .filter_map(|r| store.status(&r.name).map(|s| (r.name.clone(), s)))
                    .collect();
                (Some(store.run().run_id.clone()), stages)
            }
            None => (None, BTreeMap::new()),
        };

        let mut units = self.collaborators.status.snapshot().await?;
        if probe {
            self.probe(&mut units).await?;
        }

        Ok(StatusReport { run_id, stages, units })
    }

    #[cfg(feature = "probe")]
    async fn probe(&self, units: &mut StatusSnapshot) -> Result<(), DeployError> {
        self.collaborators.status.probe(units, PROBE_TIMEOUT).await
    }

    #[cfg(not(feature = "probe"))]
    async fn probe(&self, _units: &mut StatusSnapshot) -> Result<(), DeployError> {
        warn!("Built without the probe feature; endpoints were not probed");
        Ok(())
    }

    /// Starts deletion of the whole environment. Does not wait.
    pub async fn destroy(&self) -> Result<TargetEnvironment, DeployError> {
        let target = self.config.target();
        if let Some(latest) = OutputStore::open_latest(&self.config.state_dir)? {
            info!(run_id = %latest.run(), "Tearing down environment of latest run");
        }
        self.collaborators.provisioner.teardown(&target).await?;
        self.events
            .try_emit("run.teardown", Some(json!({"resource_group": target.resource_group})));
        Ok(target)
    }

    /// Executes `graph` against `store`.
    pub async fn run(&self, graph: &StageGraph, store: &OutputStore) -> Result<RunSummary, RunError> {
        let run = store.run().clone();
        let mut summary = RunSummary::new(&run.run_id);

        info!(
            run_id = %run.run_id,
            pipeline = graph.name(),
            stages = graph.stage_count(),
            "Starting run"
        );
        self.events.try_emit(
            "run.started",
            Some(json!({
                "run_id": run.run_id,
                "pipeline": graph.name(),
                "stages": graph.execution_order(),
            })),
        );

        for spec in graph.iter() {
            if let Some(reason) = self.cancel.reason() {
                return Err(self.halt(summary, &spec.name, DeployError::Cancelled(reason)));
            }
            summary.state.enter(spec.action.phase());

            if let Some(previous) = store.result(&spec.name).filter(StageResult::is_success) {
                self.resume(spec, store, &previous);
                summary.results.push(previous);
                continue;
            }

            let outcome = self.run_stage(spec, store, &run).await;
            summary.tolerated.extend(outcome.tolerated);
            let recorded = store.record(outcome.result.clone());
            summary.results.push(outcome.result);
            if let Err(err) = recorded {
                return Err(self.halt(summary, &spec.name, err));
            }

            match outcome.error {
                None => {
                    if matches!(spec.action, StageAction::Provision { .. }) {
                        if let Err(err) = store.mark_latest() {
                            return Err(self.halt(summary, &spec.name, err));
                        }
                    }
                }
                Some(err) if spec.policy == FailurePolicy::Tolerated && is_tolerable(&spec.action, &err) => {
                    warn!(stage = %spec.name, error = %err, "Tolerated stage failure");
                    self.events.try_emit(
                        "stage.tolerated",
                        Some(json!({"run_id": run.run_id, "stage": spec.name, "error": err.to_string()})),
                    );
                    summary.tolerated.push(FailureRecord::new(&spec.name, err.to_string()));
                }
                Some(err) => return Err(self.halt(summary, &spec.name, err)),
            }
        }

        summary.state.complete();
        info!(
            run_id = %run.run_id,
            succeeded = summary.count(StageStatus::Succeeded),
            skipped = summary.count(StageStatus::Skipped),
            tolerated = summary.tolerated.len(),
            "Run complete"
        );
        self.events.try_emit(
            "run.completed",
            Some(json!({"run_id": run.run_id, "tolerated": summary.tolerated.len()})),
        );
        Ok(summary)
    }

    fn halt(&self, mut summary: RunSummary, stage: &str, source: DeployError) -> RunError {
        summary.state.fail(stage);
        error!(
            run_id = %summary.run_id,
            stage = %stage,
            kind = %source.kind(),
            error = %source,
            "Run halted"
        );
        self.events.try_emit(
            "run.failed",
            Some(json!({
                "run_id": summary.run_id,
                "stage": stage,
                "kind": source.kind(),
                "error": source.to_string(),
            })),
        );
        RunError {
            stage: Some(stage.to_string()),
            source,
            summary: Box::new(summary),
        }
    }

    fn resume(&self, spec: &StageSpec, store: &OutputStore, previous: &StageResult) {
        let current = store
            .resolve(&spec.name, &spec.parameters, &spec.dependencies)
            .ok()
            .map(|p| p.fingerprint());
        if let (Some(current), Some(recorded)) = (current, previous.fingerprint.as_deref()) {
            if current != recorded {
                warn!(stage = %spec.name, "Parameters changed since the stage succeeded; keeping recorded result");
            }
        }
        info!(stage = %spec.name, "Stage already succeeded in this run, skipping");
        self.events.try_emit(
            "stage.resumed",
            Some(json!({"run_id": store.run().run_id, "stage": spec.name})),
        );
    }

    async fn run_stage(&self, spec: &StageSpec, store: &OutputStore, run: &RunIdentity) -> StageOutcome {
        let started = Utc::now();
        let failed = |err: DeployError| {
            self.events.try_emit(
                "stage.failed",
                Some(json!({"run_id": run.run_id, "stage": spec.name, "error": err.to_string()})),
            );
            StageOutcome {
                result: StageResult::failed(&spec.name, started, err.to_string()),
                tolerated: Vec::new(),
                error: Some(err),
            }
        };

        let (params, action) = match prepare(spec, store) {
            Ok(Prepared::Ready { params, action }) => (params, action),
            Ok(Prepared::Skip(reason)) => {
                info!(stage = %spec.name, reason = %reason, "Stage skipped");
                self.events.try_emit(
                    "stage.skipped",
                    Some(json!({"run_id": run.run_id, "stage": spec.name, "reason": reason})),
                );
                return StageOutcome {
                    result: StageResult::skipped(&spec.name, reason),
                    tolerated: Vec::new(),
                    error: None,
                };
            }
            Err(err) => return failed(err),
        };

        let ctx = StageContext::new(
            run.clone(),
            &spec.name,
            params,
            Arc::clone(&self.cancel),
            Arc::clone(&self.events),
        );
        info!(stage = %spec.name, action = spec.action.label(), policy = %spec.policy, "Stage started");
        ctx.emit(
            "stage.started",
            json!({"action": spec.action.label(), "phase": spec.action.phase(), "policy": spec.policy}),
        );

        let execution = self.execute(spec, &action, &ctx).await;
        let fingerprint = ctx.params().fingerprint();
        let tolerated: Vec<FailureRecord> = execution
            .tolerated
            .into_iter()
            .map(|(unit, error)| FailureRecord::new(&spec.name, error).with_unit(unit))
            .collect();

        match execution.error {
            None => {
                let mut result = StageResult::succeeded(&spec.name, started, execution.outputs)
                    .with_fingerprint(fingerprint)
                    .with_units(execution.units);
                if !tolerated.is_empty() {
                    result = result.with_diagnostic(format!("{} tolerated unit failure(s)", tolerated.len()));
                }
                info!(stage = %spec.name, duration_ms = result.duration_ms(), "Stage succeeded");
                ctx.emit(
                    "stage.succeeded",
                    json!({"duration_ms": result.duration_ms(), "outputs": result.outputs.keys().collect::<Vec<_>>()}),
                );
                StageOutcome {
                    result,
                    tolerated,
                    error: None,
                }
            }
            Some(err) => {
                warn!(stage = %spec.name, error = %err, "Stage failed");
                let mut outcome = failed(err);
                outcome.result = outcome
                    .result
                    .with_fingerprint(fingerprint)
                    .with_units(execution.units);
                outcome.tolerated = tolerated;
                outcome
            }
        }
    }

    async fn execute(&self, spec: &StageSpec, action: &StageAction, ctx: &StageContext) -> Execution {
        let target = self.config.target();
        let params = ctx.params();

        match action {
            StageAction::RegisterProviders { namespaces } => {
                let failures = register_providers(self.collaborators.provisioner.as_ref(), namespaces).await;
                if failures.is_empty() {
                    return Execution::default();
                }
                let exit_code = failures.first().map(|(_, e)| e.exit_code());
                let cause = failures
                    .iter()
                    .map(|(ns, e)| format!("{ns}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                Execution::from_result(Err(DeployError::provisioning(&spec.name, cause, exit_code)))
            }
            StageAction::Provision { template } => {
                match self
                    .collaborators
                    .provisioner
                    .provision(&spec.name, template, params, &spec.outputs, &target)
                    .await
                {
                    Ok(result) => Execution {
                        outputs: result.outputs,
                        ..Execution::default()
                    },
                    Err(err) => Execution::from_result(Err(err)),
                }
            }
            StageAction::ConnectCluster => Execution::from_result(
                match required(spec, params, "cluster") {
                    Ok(cluster) => self.collaborators.cluster.fetch_credentials(cluster, &target).await,
                    Err(err) => Err(err),
                },
            ),
            StageAction::AttachRegistry => Execution::from_result(
                match (required(spec, params, "cluster"), required(spec, params, "registry")) {
                    (Ok(cluster), Ok(registry)) => {
                        self.collaborators
                            .cluster
                            .attach_registry(cluster, registry, &target)
                            .await
                    }
                    (Err(err), _) | (_, Err(err)) => Err(err),
                },
            ),
            StageAction::BridgeCredentials { credentials } => {
                Execution::from_result(self.bridge(credentials, params).await)
            }
            StageAction::Install { units } => {
                let report = apply_units(self.collaborators.installer.as_ref(), units, ctx).await;
                Execution {
                    units: report.results,
                    tolerated: report.tolerated,
                    error: report.fatal,
                    ..Execution::default()
                }
            }
            StageAction::RunJob { job } => Execution::from_result(
                self.collaborators
                    .jobs
                    .run_to_completion(job, ctx)
                    .await
                    .map(|_| ()),
            ),
        }
    }

    async fn bridge(&self, credentials: &[CredentialSpec], params: &ParameterSet) -> Result<(), DeployError> {
        for cred in credentials {
            let secret = match &cred.source {
                SecretSource::ApiKey => self
                    .config
                    .api_key()
                    .cloned()
                    .ok_or_else(|| DeployError::precondition(API_KEY_VAR))?,
                SecretSource::Parameter(name) => params
                    .get(name)
                    .filter(|v| !v.trim().is_empty())
                    .map(Secret::new)
                    .ok_or_else(|| DeployError::precondition(format!("parameter '{name}'")))?,
            };
            self.collaborators
                .credentials
                .ensure_credential(&cred.name, &cred.namespace, &cred.kind, &secret)
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

/// A rejected template and cancellation halt the run regardless of policy.
fn is_tolerable(action: &StageAction, err: &DeployError) -> bool {
    match err {
        DeployError::Cancelled(_) => false,
        DeployError::ProvisioningFailed { .. } => !matches!(action, StageAction::Provision { .. }),
        _ => true,
    }
}

fn required<'a>(spec: &StageSpec, params: &'a ParameterSet, name: &str) -> Result<&'a str, DeployError> {
    params
        .get(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| DeployError::precondition(format!("parameter '{name}' of stage '{}'", spec.name)))
}

fn prepare(spec: &StageSpec, store: &OutputStore) -> Result<Prepared, DeployError> {
    for dep in &spec.dependencies {
        if !store.status(dep).is_some_and(|s| s.satisfies_dependents()) {
            return Err(DeployError::UnmetDependency {
                stage: spec.name.clone(),
                dependency: dep.clone(),
            });
        }
    }

    let upstream = &spec.dependencies;
    let params = store.resolve(&spec.name, &spec.parameters, upstream)?;

    if let Some(gate) = &spec.gate {
        if store.resolve_str(&spec.name, gate, upstream)?.trim().is_empty() {
            return Ok(Prepared::Skip(format!("gate {gate} resolved empty")));
        }
    }

    if let Some(name) = params.missing(&spec.required).first() {
        return Err(DeployError::precondition(format!(
            "parameter '{name}' of stage '{}'",
            spec.name
        )));
    }

    let action = resolve_action(spec, store)?;
    Ok(Prepared::Ready { params, action })
}

fn resolve_action(spec: &StageSpec, store: &OutputStore) -> Result<StageAction, UnresolvedReferenceError> {
    let upstream = &spec.dependencies;
    let resolve = |text: &str| store.resolve_str(&spec.name, text, upstream);

    Ok(match &spec.action {
        StageAction::Install { units } => StageAction::Install {
            units: units
                .iter()
                .map(|unit| -> Result<ServiceUnit, UnresolvedReferenceError> {
                    Ok(ServiceUnit {
                        values: store.resolve_json(&spec.name, &unit.values, upstream)?,
                        ..unit.clone()
                    })
                })
                .collect::<Result<_, _>>()?,
        },
        StageAction::RunJob { job } => {
            let mut job = job.clone();
            job.image = resolve(&job.image)?;
            for value in job.env.values_mut() {
                *value = resolve(value.as_str())?;
            }
            StageAction::RunJob { job }
        }
        StageAction::BridgeCredentials { credentials } => StageAction::BridgeCredentials {
            credentials: credentials
                .iter()
                .map(|cred| -> Result<CredentialSpec, UnresolvedReferenceError> {
                    let kind = match &cred.kind {
                        CredentialKind::DockerRegistry { server, username } => CredentialKind::DockerRegistry {
                            server: resolve(server)?,
                            username: resolve(username)?,
                        },
                        other => other.clone(),
                    };
                    Ok(CredentialSpec { kind, ..cred.clone() })
                })
                .collect::<Result<_, _>>()?,
        },
        other => other.clone(),
    })
}
