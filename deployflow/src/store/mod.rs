//! The output store.
//!
//! Maps stage names to the outputs they produced and persists every
//! recorded [`StageResult`] under `<state_dir>/runs/<run_id>.json`. A retried
//! run that reopens the same run id sees the stages that already succeeded.

mod reference;

pub use reference::{references_in, references_in_json, Reference};

use crate::context::RunIdentity;
use crate::core::{ParameterSet, StageResult, StageStatus};
use crate::errors::{DeployError, OutputConflictError, UnresolvedReferenceError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RUNS_DIR: &str = "runs";
const LATEST_FILE: &str = "latest.json";

/// The persisted form of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The run id.
    pub run_id: String,
    /// When the run was first opened.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Every recorded result, in append order.
    #[serde(default)]
    pub results: Vec<StageResult>,
}

impl RunRecord {
    fn new(run: &RunIdentity) -> Self {
        Self {
            run_id: run.run_id.clone(),
            created_at: run.created_at,
            updated_at: Utc::now(),
            results: Vec::new(),
        }
    }

    fn succeeded(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.name == stage && r.is_success())
    }

    fn latest(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().rev().find(|r| r.name == stage)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    run_id: String,
}

/// Stage outputs for one run, optionally backed by a state directory.
#[derive(Debug)]
pub struct OutputStore {
    run: RunIdentity,
    state_dir: Option<PathBuf>,
    record: RwLock<RunRecord>,
}

impl OutputStore {
    /// Creates a store that is never written to disk.
    #[must_use]
    pub fn in_memory(run: RunIdentity) -> Self {
        let record = RunRecord::new(&run);
        Self {
            run,
            state_dir: None,
            record: RwLock::new(record),
        }
    }

    /// Opens (or creates) the store for `run` under `state_dir`.
    ///
    /// An existing record for the same run id is loaded so completed stages
    /// are visible to the retried run.
    pub fn open(state_dir: impl AsRef<Path>, run: RunIdentity) -> Result<Self, DeployError> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let path = run_path(&state_dir, &run.run_id);
        let record = if path.exists() {
            let record: RunRecord = serde_json::from_slice(&std::fs::read(&path)?)?;
            info!(
                run_id = %run.run_id,
                results = record.results.len(),
                "Reopened existing run state"
            );
            record
        } else {
            RunRecord::new(&run)
        };
        let run = RunIdentity {
            run_id: record.run_id.clone(),
            created_at: record.created_at,
        };
        Ok(Self {
            run,
            state_dir: Some(state_dir),
            record: RwLock::new(record),
        })
    }

    /// Opens the run that `latest.json` points at, if any.
    pub fn open_latest(state_dir: impl AsRef<Path>) -> Result<Option<Self>, DeployError> {
        let state_dir = state_dir.as_ref();
        let pointer = state_dir.join(LATEST_FILE);
        if !pointer.exists() {
            return Ok(None);
        }
        let latest: LatestPointer = serde_json::from_slice(&std::fs::read(&pointer)?)?;
        if !run_path(state_dir, &latest.run_id).exists() {
            return Ok(None);
        }
        Self::open(state_dir, RunIdentity::with_run_id(latest.run_id)).map(Some)
    }

    /// Returns the run identity.
    #[must_use]
    pub fn run(&self) -> &RunIdentity {
        &self.run
    }

    /// Returns the backing state directory, if persisted.
    #[must_use]
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Appends a result.
    ///
    /// Failed and skipped results may be appended repeatedly; a second
    /// succeeded result for the same stage is rejected.
    pub fn record(&self, result: StageResult) -> Result<(), DeployError> {
        let snapshot = {
            let mut record = self.record.write();
            if result.is_success() && record.succeeded(&result.name).is_some() {
                return Err(OutputConflictError::new(
                    &result.name,
                    "stage already has a succeeded result in this run",
                )
                .into());
            }
            debug!(stage = %result.name, status = %result.status, "Recording stage result");
            record.results.push(result);
            record.updated_at = Utc::now();
            record.clone()
        };
        self.persist(&snapshot)
    }

    /// Records `outputs` as a succeeded result for `stage`.
    pub fn put(&self, stage: &str, outputs: BTreeMap<String, String>) -> Result<(), DeployError> {
        self.record(StageResult::succeeded(stage, Utc::now(), outputs))
    }

    /// Returns a single output of a succeeded stage.
    pub fn get(&self, stage: &str, key: &str) -> Result<String, DeployError> {
        self.record
            .read()
            .succeeded(stage)
            .and_then(|r| r.outputs.get(key).cloned())
            .ok_or_else(|| DeployError::NotFound {
                stage: stage.to_string(),
                key: key.to_string(),
            })
    }

    /// Returns true if `stage` has a succeeded result.
    #[must_use]
    pub fn has_succeeded(&self, stage: &str) -> bool {
        self.record.read().succeeded(stage).is_some()
    }

    /// Returns the status of the most recent result for `stage`.
    #[must_use]
    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        let record = self.record.read();
        if record.succeeded(stage).is_some() {
            return Some(StageStatus::Succeeded);
        }
        record.latest(stage).map(|r| r.status)
    }

    /// Returns the succeeded result for `stage`, else its latest result.
    #[must_use]
    pub fn result(&self, stage: &str) -> Option<StageResult> {
        let record = self.record.read();
        record.succeeded(stage).or_else(|| record.latest(stage)).cloned()
    }

    /// Returns every recorded result in append order.
    #[must_use]
    pub fn results(&self) -> Vec<StageResult> {
        self.record.read().results.clone()
    }

    /// Resolves one reference, honouring the optional marker.
    ///
    /// `upstream` lists the stages the resolving stage depends on.
    pub fn lookup(&self, stage: &str, reference: &Reference, upstream: &[String]) -> Result<String, UnresolvedReferenceError> {
        let unresolved = |reason: &str| UnresolvedReferenceError::new(stage, reference.to_string(), reason);
        if !upstream.iter().any(|s| s == &reference.stage) {
            return Err(unresolved("referenced stage is not a declared dependency"));
        }
        let record = self.record.read();
        let value = record
            .succeeded(&reference.stage)
            .and_then(|r| r.outputs.get(&reference.key));
        match value {
            Some(value) => Ok(value.clone()),
            None if reference.optional => Ok(String::new()),
            None if record.succeeded(&reference.stage).is_some() => Err(unresolved("key absent from stage outputs")),
            None => Err(unresolved("stage has no succeeded result")),
        }
    }

    /// Substitutes every reference in `text`.
    pub fn resolve_str(&self, stage: &str, text: &str, upstream: &[String]) -> Result<String, UnresolvedReferenceError> {
        reference::substitute(text, |r| self.lookup(stage, r, upstream).map_err(|e| e.reason))
            .map_err(|(r, reason)| UnresolvedReferenceError::new(stage, r.to_string(), reason))
    }

    /// Resolves a parameter template into concrete values.
    pub fn resolve(
        &self,
        stage: &str,
        template: &ParameterSet,
        upstream: &[String],
    ) -> Result<ParameterSet, UnresolvedReferenceError> {
        template
            .iter()
            .map(|(name, value)| Ok((name.to_string(), self.resolve_str(stage, value, upstream)?)))
            .collect()
    }

    /// Substitutes references in the string leaves of a JSON document.
    pub fn resolve_json(
        &self,
        stage: &str,
        value: &serde_json::Value,
        upstream: &[String],
    ) -> Result<serde_json::Value, UnresolvedReferenceError> {
        use serde_json::Value;
        Ok(match value {
            Value::String(s) => Value::String(self.resolve_str(stage, s, upstream)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_json(stage, v, upstream))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_json(stage, v, upstream)?)))
                    .collect::<Result<_, UnresolvedReferenceError>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Seeds a new run with the succeeded results of `stages`.
    pub fn fork(&self, run: RunIdentity, stages: &[&str]) -> Result<Self, DeployError> {
        let seeded: Vec<StageResult> = {
            let record = self.record.read();
            stages
                .iter()
                .filter_map(|s| record.succeeded(s).cloned())
                .collect()
        };
        let forked = match &self.state_dir {
            Some(dir) => Self::open(dir, run)?,
            None => Self::in_memory(run),
        };
        for result in seeded {
            if !forked.has_succeeded(&result.name) {
                forked.record(result)?;
            }
        }
        info!(from = %self.run, to = %forked.run, "Forked run state");
        Ok(forked)
    }

    /// Points `latest.json` at this run.
    pub fn mark_latest(&self) -> Result<(), DeployError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let pointer = LatestPointer {
            run_id: self.run.run_id.clone(),
        };
        write_atomic(&dir.join(LATEST_FILE), &serde_json::to_vec_pretty(&pointer)?)
    }

    fn persist(&self, record: &RunRecord) -> Result<(), DeployError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        write_atomic(&run_path(dir, &record.run_id), &serde_json::to_vec_pretty(record)?)
    }
}

fn run_path(state_dir: &Path, run_id: &str) -> PathBuf {
    state_dir.join(RUNS_DIR).join(format!("{run_id}.json"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DeployError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeployError;
    use pretty_assertions::assert_eq;

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn upstream(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_put_and_get() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store.put("infra", outputs(&[("clusterName", "alpha-aks")])).unwrap();

        assert_eq!(store.get("infra", "clusterName").unwrap(), "alpha-aks");
        assert!(matches!(
            store.get("infra", "registryName"),
            Err(DeployError::NotFound { .. })
        ));
        assert!(matches!(store.get("nope", "x"), Err(DeployError::NotFound { .. })));
    }

    #[test]
    fn test_second_success_conflicts() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store.put("infra", outputs(&[("a", "1")])).unwrap();
        let err = store.put("infra", outputs(&[("a", "2")])).unwrap_err();
        assert!(matches!(err, DeployError::OutputConflict(_)));
        assert_eq!(store.get("infra", "a").unwrap(), "1");
    }

    #[test]
    fn test_failed_then_succeeded_supersedes() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store
            .record(StageResult::failed("infra", Utc::now(), "quota"))
            .unwrap();
        assert_eq!(store.status("infra"), Some(StageStatus::Failed));
        store.put("infra", outputs(&[("a", "1")])).unwrap();
        assert_eq!(store.status("infra"), Some(StageStatus::Succeeded));
        assert_eq!(store.results().len(), 2);
    }

    #[test]
    fn test_resolve_substitutes_references() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store
            .put("infra", outputs(&[("clusterName", "alpha-aks"), ("rg", "alpha-rg")]))
            .unwrap();

        let template = ParameterSet::new()
            .with("cluster", "${infra.clusterName}")
            .with("scope", "/rg/${infra.rg}/x")
            .with("static", "eastus");
        let resolved = store.resolve("kube-context", &template, &upstream(&["infra"])).unwrap();

        assert_eq!(resolved.get("cluster"), Some("alpha-aks"));
        assert_eq!(resolved.get("scope"), Some("/rg/alpha-rg/x"));
        assert_eq!(resolved.get("static"), Some("eastus"));
    }

    #[test]
    fn test_resolve_rejects_missing_and_non_upstream() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store.put("infra", outputs(&[("clusterName", "c")])).unwrap();

        let template = ParameterSet::new().with("x", "${infra.missing}");
        let err = store.resolve("s", &template, &upstream(&["infra"])).unwrap_err();
        assert_eq!(err.reference, "infra.missing");
        assert_eq!(err.reason, "key absent from stage outputs");

        let template = ParameterSet::new().with("x", "${infra.clusterName}");
        let err = store.resolve("s", &template, &upstream(&[])).unwrap_err();
        assert_eq!(err.reason, "referenced stage is not a declared dependency");

        let template = ParameterSet::new().with("x", "${ghost.key}");
        let err = store.resolve("s", &template, &upstream(&["ghost"])).unwrap_err();
        assert_eq!(err.reason, "stage has no succeeded result");
    }

    #[test]
    fn test_optional_reference_resolves_empty() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store.put("infra", outputs(&[])).unwrap();
        let value = store
            .resolve_str("attach-registry", "${infra.registryName?}", &upstream(&["infra"]))
            .unwrap();
        assert_eq!(value, "");
    }

    #[test]
    fn test_resolve_json_leaves() {
        let store = OutputStore::in_memory(RunIdentity::with_run_id("r1"));
        store.put("infra", outputs(&[("storageClass", "azurefile")])).unwrap();

        let values = serde_json::json!({
            "persistence": {"storageClass": "${infra.storageClass}", "size": 50},
            "tags": ["${infra.storageClass}-a"]
        });
        let resolved = store.resolve_json("data-tier", &values, &upstream(&["infra"])).unwrap();
        assert_eq!(resolved["persistence"]["storageClass"], "azurefile");
        assert_eq!(resolved["persistence"]["size"], 50);
        assert_eq!(resolved["tags"][0], "azurefile-a");
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OutputStore::open(dir.path(), RunIdentity::with_run_id("run-a")).unwrap();
            store.put("infra", outputs(&[("clusterName", "alpha-aks")])).unwrap();
            store.mark_latest().unwrap();
        }
        assert!(dir.path().join("runs").join("run-a.json").exists());

        let reopened = OutputStore::open(dir.path(), RunIdentity::with_run_id("run-a")).unwrap();
        assert!(reopened.has_succeeded("infra"));
        assert_eq!(reopened.get("infra", "clusterName").unwrap(), "alpha-aks");

        let latest = OutputStore::open_latest(dir.path()).unwrap().unwrap();
        assert_eq!(latest.run().run_id, "run-a");
    }

    #[test]
    fn test_open_latest_without_pointer() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OutputStore::open_latest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_fork_copies_named_successes() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::open(dir.path(), RunIdentity::with_run_id("base")).unwrap();
        store.put("infra", outputs(&[("clusterName", "c")])).unwrap();
        store.put("workload", outputs(&[])).unwrap();
        store
            .record(StageResult::failed("load-data", Utc::now(), "timeout"))
            .unwrap();

        let forked = store
            .fork(RunIdentity::with_run_id("reload"), &["infra", "load-data"])
            .unwrap();

        assert!(forked.has_succeeded("infra"));
        assert!(!forked.has_succeeded("workload"));
        assert!(forked.status("load-data").is_none());
        assert!(dir.path().join("runs").join("reload.json").exists());
    }
}
