//! The default bring-up pipeline.

use crate::config::DeployConfig;
use crate::core::FailurePolicy;
use crate::errors::PipelineValidationError;
use crate::pipeline::{CredentialSpec, PipelineBuilder, SecretSource, StageAction, StageGraph, StageSpec};
use crate::platform::{CredentialKind, JobSpec, ServiceUnit};
use serde_json::json;

/// Registers capability providers.
pub const PROVIDERS_STAGE: &str = "providers";
/// Provisions network, storage and compute.
pub const INFRA_STAGE: &str = "infra";
/// Fetches cluster credentials.
pub const KUBE_CONTEXT_STAGE: &str = "kube-context";
/// Attaches the container registry to the cluster.
pub const ATTACH_REGISTRY_STAGE: &str = "attach-registry";
/// Bridges registry and API-key secrets.
pub const CREDENTIALS_STAGE: &str = "registry-credentials";
/// Installs the GPU operator.
pub const OPERATOR_STAGE: &str = "platform-operator";
/// Installs the vector database.
pub const DATA_TIER_STAGE: &str = "data-tier";
/// Installs the inference services.
pub const AI_TIER_STAGE: &str = "ai-tier";
/// Applies the agent workload.
pub const WORKLOAD_STAGE: &str = "workload";
/// Runs the data-load job.
pub const LOAD_DATA_STAGE: &str = "load-data";

const MODEL_REGISTRY: &str = "nvcr.io";
const MODEL_REGISTRY_USER: &str = "$oauthtoken";
const REGISTRY_SECRET: &str = "ngc-registry";
const API_KEY_SECRET: &str = "ngc-api";
const NIM_REPO: &str = "https://helm.ngc.nvidia.com/nim";
const MILVUS_PORT: &str = "19530";

/// Builds the bring-up pipeline for `config`.
///
/// The data-load stage is appended when `with_load_data` is set.
pub fn pipeline(config: &DeployConfig, with_load_data: bool) -> Result<StageGraph, PipelineValidationError> {
    let mut builder = PipelineBuilder::new("deploy")
        .stage(StageSpec::new(
            PROVIDERS_STAGE,
            StageAction::RegisterProviders {
                namespaces: config.providers.clone(),
            },
        ))?
        .stage(
            StageSpec::new(
                INFRA_STAGE,
                StageAction::Provision {
                    template: config.template.clone(),
                },
            )
            .with_dependency(PROVIDERS_STAGE)
            .with_required_param("prefix", &config.prefix)
            .with_required_param("location", &config.region)
            .with_outputs(["clusterName", "registryServer"]),
        )?
        .stage(
            StageSpec::new(KUBE_CONTEXT_STAGE, StageAction::ConnectCluster)
                .with_dependency(INFRA_STAGE)
                .with_required_param("cluster", "${infra.clusterName}"),
        )?
        .stage(
            StageSpec::new(ATTACH_REGISTRY_STAGE, StageAction::AttachRegistry)
                .with_dependencies([INFRA_STAGE, KUBE_CONTEXT_STAGE])
                .tolerated()
                .with_gate("${infra.registryName?}")
                .with_required_param("cluster", "${infra.clusterName}")
                .with_required_param("registry", "${infra.registryName?}"),
        )?
        .stage(
            StageSpec::new(
                CREDENTIALS_STAGE,
                StageAction::BridgeCredentials {
                    credentials: credentials(config),
                },
            )
            .with_dependency(KUBE_CONTEXT_STAGE),
        )?
        .stage(
            StageSpec::new(
                OPERATOR_STAGE,
                StageAction::Install {
                    units: vec![ServiceUnit::chart(&config.operator_namespace, "gpu-operator", "gpu-operator")
                        .with_repo("https://helm.ngc.nvidia.com/nvidia")
                        .with_values(json!({"driver": {"enabled": false}}))
                        .with_wait()],
                },
            )
            .with_dependency(CREDENTIALS_STAGE),
        )?
        .stage(
            StageSpec::new(
                DATA_TIER_STAGE,
                StageAction::Install {
                    units: vec![ServiceUnit::chart(&config.data_namespace, "milvus", "milvus")
                        .with_repo("https://zilliztech.github.io/milvus-helm/")
                        .with_values(json!({
                            "cluster": {"enabled": false},
                            "etcd": {"replicaCount": 1},
                            "minio": {"mode": "standalone"},
                            "pulsar": {"enabled": false},
                        }))
                        .with_wait()],
                },
            )
            .with_dependency(OPERATOR_STAGE),
        )?
        .stage(
            StageSpec::new(
                AI_TIER_STAGE,
                StageAction::Install {
                    units: inference_units(config),
                },
            )
            .with_dependencies([CREDENTIALS_STAGE, OPERATOR_STAGE]),
        )?
        .stage(
            StageSpec::new(
                WORKLOAD_STAGE,
                StageAction::Install {
                    units: vec![ServiceUnit::manifest(
                        &config.app_namespace,
                        "alpha-agent",
                        config.manifests_dir.join("agent.yaml"),
                    )],
                },
            )
            .with_dependencies([DATA_TIER_STAGE, AI_TIER_STAGE]),
        )?;

    if with_load_data {
        builder = builder.stage(
            StageSpec::new(
                LOAD_DATA_STAGE,
                StageAction::RunJob {
                    job: load_job(config),
                },
            )
            .with_dependencies([INFRA_STAGE, DATA_TIER_STAGE, WORKLOAD_STAGE]),
        )?;
    }

    builder.build()
}

fn credentials(config: &DeployConfig) -> Vec<CredentialSpec> {
    let registry = CredentialKind::DockerRegistry {
        server: MODEL_REGISTRY.to_string(),
        username: MODEL_REGISTRY_USER.to_string(),
    };
    let api_key = CredentialKind::Opaque {
        key: crate::config::API_KEY_VAR.to_string(),
    };
    vec![
        CredentialSpec::new(REGISTRY_SECRET, &config.ai_namespace, registry, SecretSource::ApiKey),
        CredentialSpec::new(API_KEY_SECRET, &config.ai_namespace, api_key.clone(), SecretSource::ApiKey),
        CredentialSpec::new(API_KEY_SECRET, &config.app_namespace, api_key, SecretSource::ApiKey),
    ]
}

fn inference_units(config: &DeployConfig) -> Vec<ServiceUnit> {
    [
        ("nim-llm", "nim-llm", "llama-3.1-nemotron-nano-4b-v1.1"),
        ("nim-embed", "text-embedding-nim", "llama-3.2-nv-embedqa-1b-v2"),
        ("nim-rerank", "text-reranking-nim", "llama-3.2-nv-rerankqa-1b-v2"),
    ]
    .into_iter()
    .map(|(release, chart, model)| {
        ServiceUnit::chart(&config.ai_namespace, release, chart)
            .with_repo(NIM_REPO)
            .with_values(json!({
                "image": {"repository": format!("{MODEL_REGISTRY}/nim/nvidia/{model}")},
                "imagePullSecrets": [{"name": REGISTRY_SECRET}],
                "model": {"ngcAPISecret": API_KEY_SECRET},
            }))
            .with_policy(FailurePolicy::Tolerated)
    })
    .collect()
}

fn load_job(config: &DeployConfig) -> JobSpec {
    JobSpec::new("alpha-ingest", &config.app_namespace, &config.loader_image)
        .with_command(["python", "ingest.py"])
        .with_env("ANF_MOUNT_PATH", &config.data_mount_path)
        .with_env(
            "MILVUS_HOST",
            format!("milvus.{}.svc.cluster.local", config.data_namespace),
        )
        .with_env("MILVUS_PORT", MILVUS_PORT)
        .with_env("TICKERS", config.tickers.join(","))
        .with_volume(&config.data_claim, &config.data_mount_path)
        .with_env_from_secret(API_KEY_SECRET)
        .with_timeout(config.job_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_order() {
        let graph = pipeline(&DeployConfig::default(), true).unwrap();
        assert_eq!(
            graph.execution_order(),
            &[
                PROVIDERS_STAGE,
                INFRA_STAGE,
                KUBE_CONTEXT_STAGE,
                ATTACH_REGISTRY_STAGE,
                CREDENTIALS_STAGE,
                OPERATOR_STAGE,
                DATA_TIER_STAGE,
                AI_TIER_STAGE,
                WORKLOAD_STAGE,
                LOAD_DATA_STAGE,
            ]
        );
    }

    #[test]
    fn test_load_data_is_optional() {
        let graph = pipeline(&DeployConfig::default(), false).unwrap();
        assert_eq!(graph.stage_count(), 9);
        assert!(!graph.contains(LOAD_DATA_STAGE));
    }

    #[test]
    fn test_inference_units_are_tolerated() {
        let graph = pipeline(&DeployConfig::default(), false).unwrap();
        let Some(StageAction::Install { units }) = graph.get(AI_TIER_STAGE).map(|s| &s.action) else {
            panic!("ai-tier must install units");
        };
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.policy == FailurePolicy::Tolerated));
        assert_eq!(graph.get(OPERATOR_STAGE).unwrap().policy, FailurePolicy::Fatal);
    }

    #[test]
    fn test_load_data_subgraph() {
        let graph = pipeline(&DeployConfig::default(), true).unwrap();
        let sub = graph.subgraph(LOAD_DATA_STAGE).unwrap();
        assert!(!sub.contains(ATTACH_REGISTRY_STAGE));
        assert_eq!(sub.execution_order().last().map(String::as_str), Some(LOAD_DATA_STAGE));
    }

    #[test]
    fn test_load_job_contract() {
        let config = DeployConfig {
            job_timeout_secs: 300,
            ..DeployConfig::default()
        };
        let job = load_job(&config);
        assert_eq!(job.env["ANF_MOUNT_PATH"], "/mnt/anf/data");
        assert_eq!(job.env["MILVUS_PORT"], "19530");
        assert_eq!(job.env["TICKERS"], "AAPL,MSFT,TSLA");
        assert_eq!(job.claim.as_deref(), Some("anf-data"));
        assert_eq!(job.timeout_secs, 300);
    }
}
