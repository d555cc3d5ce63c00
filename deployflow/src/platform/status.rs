//! Read-only readiness snapshot of installed services.

use super::command::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Readiness of one workload or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Resource kind (`Deployment`, `StatefulSet`, `Service`).
    pub kind: String,
    /// Whether every desired replica is ready.
    pub ready: bool,
    /// `host:port` the unit is reachable at, if exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Result of an HTTP probe of the endpoint, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reachable: Option<bool>,
}

/// Snapshot keyed by `namespace/name`.
pub type StatusSnapshot = BTreeMap<String, UnitStatus>;

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    kind: String,
    metadata: Metadata,
    #[serde(default)]
    spec: serde_json::Value,
    #[serde(default)]
    status: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: String,
}

fn replicas_ready(resource: &Resource) -> bool {
    let desired = resource.spec["replicas"].as_u64().unwrap_or(1);
    let ready = resource.status["readyReplicas"].as_u64().unwrap_or(0);
    ready >= desired
}

fn service_endpoint(resource: &Resource) -> Option<String> {
    let port = resource.spec["ports"][0]["port"].as_u64()?;
    let host = if resource.spec["type"] == "LoadBalancer" {
        let ingress = &resource.status["loadBalancer"]["ingress"][0];
        ingress["ip"].as_str().or_else(|| ingress["hostname"].as_str())?
    } else {
        resource.spec["clusterIP"].as_str().filter(|ip| *ip != "None")?
    };
    Some(format!("{host}:{port}"))
}

/// Builds a snapshot from `kubectl get ... -o json` output.
#[must_use]
fn build_snapshot(list: ResourceList) -> StatusSnapshot {
    let mut snapshot = StatusSnapshot::new();
    let mut services = Vec::new();

    for resource in list.items {
        if SYSTEM_NAMESPACES.contains(&resource.metadata.namespace.as_str()) {
            continue;
        }
        let key = format!("{}/{}", resource.metadata.namespace, resource.metadata.name);
        let kind = resource.kind.clone();
        match kind.as_str() {
            "Deployment" | "StatefulSet" => {
                snapshot.insert(
                    key,
                    UnitStatus {
                        kind,
                        ready: replicas_ready(&resource),
                        endpoint: None,
                        reachable: None,
                    },
                );
            }
            "Service" if key != "default/kubernetes" => services.push((key, resource)),
            _ => {}
        }
    }

    for (key, service) in services {
        let endpoint = service_endpoint(&service);
        match snapshot.get_mut(&key) {
            Some(unit) => unit.endpoint = endpoint,
            None => {
                let pending_lb = service.spec["type"] == "LoadBalancer" && endpoint.is_none();
                snapshot.insert(
                    key,
                    UnitStatus {
                        kind: service.kind,
                        ready: !pending_lb,
                        endpoint,
                        reachable: None,
                    },
                );
            }
        }
    }

    snapshot
}

/// Reports unit readiness from the platform.
#[derive(Clone)]
pub struct StatusReporter {
    runner: Arc<dyn CommandRunner>,
}

impl StatusReporter {
    /// Creates a reporter that runs `kubectl` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Returns the readiness of every non-system workload and service.
    pub async fn snapshot(&self) -> Result<StatusSnapshot, DeployError> {
        let spec = CommandSpec::new("kubectl").args([
            "get",
            "deployments,statefulsets,services",
            "--all-namespaces",
            "--output",
            "json",
        ]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(crate::errors::CommandError::new("kubectl", out.diagnostic())
                .with_exit_code(out.exit_code)
                .into());
        }
        let list: ResourceList = out.json("kubectl")?;
        let snapshot = build_snapshot(list);
        debug!(units = snapshot.len(), "Status snapshot taken");
        Ok(snapshot)
    }

    /// Fills `reachable` for every unit with an endpoint.
    #[cfg(feature = "probe")]
    pub async fn probe(&self, snapshot: &mut StatusSnapshot, timeout: std::time::Duration) -> Result<(), DeployError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::errors::CommandError::new("probe", e.to_string()))?;

        let checks = snapshot.iter().filter_map(|(key, unit)| {
            let endpoint = unit.endpoint.clone()?;
            let client = client.clone();
            Some(async move {
                let reachable = client.get(format!("http://{endpoint}/")).send().await.is_ok();
                (key.clone(), reachable)
            })
        });
        let results = futures::future::join_all(checks).await;

        for (key, reachable) in results {
            if let Some(unit) = snapshot.get_mut(&key) {
                unit.reachable = Some(reachable);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CommandOutput;
    use crate::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cluster_state() -> serde_json::Value {
        json!({"items": [
            {"kind": "StatefulSet", "metadata": {"name": "milvus", "namespace": "milvus"},
             "spec": {"replicas": 1}, "status": {"readyReplicas": 1}},
            {"kind": "Service", "metadata": {"name": "milvus", "namespace": "milvus"},
             "spec": {"type": "ClusterIP", "clusterIP": "10.0.0.9", "ports": [{"port": 19530}]}},
            {"kind": "Deployment", "metadata": {"name": "nim-llm", "namespace": "nim"},
             "spec": {"replicas": 1}, "status": {}},
            {"kind": "Service", "metadata": {"name": "agent-ui", "namespace": "alpha"},
             "spec": {"type": "LoadBalancer", "ports": [{"port": 80}]},
             "status": {"loadBalancer": {"ingress": [{"ip": "20.1.2.3"}]}}},
            {"kind": "Service", "metadata": {"name": "pending", "namespace": "alpha"},
             "spec": {"type": "LoadBalancer", "ports": [{"port": 80}]}, "status": {}},
            {"kind": "Deployment", "metadata": {"name": "coredns", "namespace": "kube-system"},
             "spec": {"replicas": 2}, "status": {"readyReplicas": 2}},
            {"kind": "Service", "metadata": {"name": "kubernetes", "namespace": "default"},
             "spec": {"type": "ClusterIP", "clusterIP": "10.0.0.1", "ports": [{"port": 443}]}}
        ]})
    }

    #[tokio::test]
    async fn test_snapshot_merges_services_into_workloads() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "kubectl",
            &["get"],
            CommandOutput::ok(cluster_state().to_string()),
        ));
        let snapshot = StatusReporter::new(runner).snapshot().await.unwrap();

        let keys: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["alpha/agent-ui", "alpha/pending", "milvus/milvus", "nim/nim-llm"]
        );

        let milvus = &snapshot["milvus/milvus"];
        assert!(milvus.ready);
        assert_eq!(milvus.kind, "StatefulSet");
        assert_eq!(milvus.endpoint.as_deref(), Some("10.0.0.9:19530"));

        assert!(!snapshot["nim/nim-llm"].ready);
        assert_eq!(snapshot["alpha/agent-ui"].endpoint.as_deref(), Some("20.1.2.3:80"));
        assert!(!snapshot["alpha/pending"].ready);
        assert!(snapshot["alpha/pending"].reachable.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_read_only() {
        let runner = Arc::new(ScriptedRunner::new().on("kubectl", &["get"], CommandOutput::ok(r#"{"items": []}"#)));
        let reporter = StatusReporter::new(runner.clone());

        assert!(reporter.snapshot().await.unwrap().is_empty());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "get");
    }

    #[tokio::test]
    async fn test_snapshot_failure() {
        let runner = Arc::new(ScriptedRunner::new().on("kubectl", &["get"], CommandOutput::failed(1, "no context")));
        let err = StatusReporter::new(runner).snapshot().await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("no context"));
    }
}
