#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::config::DeployConfig;
    use crate::context::RunIdentity;
    use crate::core::{RunState, StageStatus};
    use crate::errors::{DeployError, ErrorKind};
    use crate::events::CollectingEventSink;
    use crate::orchestrator::*;
    use crate::pipeline::{PipelineBuilder, StageAction, StageSpec};
    use crate::platform::{CommandOutput, JobPhase, MockResourceProvisioner, Secret};
    use crate::store::OutputStore;
    use crate::testing::{FakePlatform, ScriptedRunner};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(state_dir: &Path) -> DeployConfig {
        DeployConfig {
            state_dir: state_dir.to_path_buf(),
            api_key: Some(Secret::new("nvapi-test")),
            ..DeployConfig::default()
        }
    }

    fn platform() -> FakePlatform {
        let platform = FakePlatform::new();
        platform.provisioner.set_outputs(
            INFRA_STAGE,
            [
                ("clusterName", "alpha-aks"),
                ("registryServer", "alpha.azurecr.io"),
                ("registryName", "alphaacr"),
            ],
        );
        platform
    }

    fn orchestrator(config: DeployConfig, platform: &FakePlatform) -> Orchestrator {
        Orchestrator::new(config, platform.collaborators(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_missing_secret_makes_no_provisioning_call() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        let mut provisioner = MockResourceProvisioner::new();
        provisioner.expect_provision().times(0);
        provisioner.expect_register_provider().times(0);
        let collaborators = platform
            .collaborators(Duration::from_secs(1))
            .with_provisioner(Arc::new(provisioner));

        let config = DeployConfig {
            api_key: None,
            ..config(dir.path())
        };
        let err = Orchestrator::new(config, collaborators).deploy(None).await.unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::PreconditionMissing);
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.stage, None);
        assert!(platform.log.is_empty());
        assert!(!dir.path().join("runs").exists());
    }

    #[tokio::test]
    async fn test_deploy_runs_stages_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        let summary = orchestrator(config(dir.path()), &platform).deploy(None).await.unwrap();

        assert_eq!(summary.state, RunState::Complete);
        assert_eq!(summary.count(StageStatus::Succeeded), 9);
        assert_eq!(platform.log.count("register:"), 5);

        let entries = platform.log.entries();
        assert_eq!(
            entries[5..].to_vec(),
            vec![
                "provision:infra",
                "connect:alpha-aks",
                "attach:alpha-aks:alphaacr",
                "credential:nim/ngc-registry",
                "credential:nim/ngc-api",
                "credential:alpha/ngc-api",
                "install:gpu-operator/gpu-operator",
                "install:milvus/milvus",
                "install:nim/nim-llm",
                "install:nim/nim-embed",
                "install:nim/nim-rerank",
                "install:alpha/alpha-agent",
            ]
        );
        assert_eq!(platform.credentials.material("nim/ngc-registry").as_deref(), Some("nvapi-test"));
        assert!(dir.path().join("latest.json").exists());
    }

    #[tokio::test]
    async fn test_provision_receives_static_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        orchestrator(config(dir.path()), &platform).deploy(None).await.unwrap();

        let params = platform.provisioner.params_for(INFRA_STAGE).unwrap();
        assert_eq!(params.get("prefix"), Some("alpha"));
        assert_eq!(params.get("location"), Some("eastus"));
    }

    #[tokio::test]
    async fn test_absent_registry_skips_attach_stage() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new();
        platform.provisioner.set_outputs(
            INFRA_STAGE,
            [("clusterName", "alpha-aks"), ("registryServer", "alpha.azurecr.io")],
        );
        let events = Arc::new(CollectingEventSink::new());

        let summary = orchestrator(config(dir.path()), &platform)
            .with_event_sink(events.clone())
            .deploy(None)
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(
            summary.result(ATTACH_REGISTRY_STAGE).map(|r| r.status),
            Some(StageStatus::Skipped)
        );
        assert_eq!(platform.log.count("attach:"), 0);
        assert_eq!(events.events_of_type("stage.skipped").len(), 1);
        assert_eq!(events.events_of_type("run.completed").len(), 1);
    }

    #[tokio::test]
    async fn test_registry_output_from_deployment_attaches_registry() {
        let dir = tempfile::tempdir().unwrap();
        let deployment = serde_json::json!({
            "properties": {
                "provisioningState": "Succeeded",
                "outputs": {
                    "clusterName": {"type": "String", "value": "alpha-aks"},
                    "registryServer": {"type": "String", "value": "alpha.azurecr.io"},
                    "registryName": {"type": "String", "value": "alphaacr"}
                }
            }
        });
        let runner = Arc::new(ScriptedRunner::new().on(
            "az",
            &["deployment", "group", "create"],
            CommandOutput::ok(deployment.to_string()),
        ));
        let collaborators = Collaborators::from_runner(runner.clone(), Duration::from_secs(1));

        let summary = Orchestrator::new(config(dir.path()), collaborators)
            .deploy(None)
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(
            summary.result(ATTACH_REGISTRY_STAGE).map(|r| r.status),
            Some(StageStatus::Succeeded)
        );
        assert_eq!(
            summary.result(INFRA_STAGE).and_then(|r| r.output("registryName")),
            Some("alphaacr")
        );

        let attach = runner.calls_matching("az", &["aks", "update"]);
        assert_eq!(attach.len(), 1);
        assert_eq!(attach[0].flag_value("--attach-acr"), Some("alphaacr"));
        assert_eq!(attach[0].flag_value("--name"), Some("alpha-aks"));
    }

    #[tokio::test]
    async fn test_tolerated_unit_failure_then_success_completes() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();
        platform.installer.fail("nim/nim-llm", "ImagePullBackOff", 1);

        let summary = orchestrator(config(dir.path()), &platform).deploy(None).await.unwrap();

        assert_eq!(summary.state, RunState::Complete);
        assert_eq!(summary.tolerated.len(), 1);
        assert_eq!(summary.tolerated[0].stage, AI_TIER_STAGE);
        assert_eq!(summary.tolerated[0].unit.as_deref(), Some("nim/nim-llm"));

        let llm = platform.log.position("install:nim/nim-llm").unwrap();
        let embed = platform.log.position("install:nim/nim-embed").unwrap();
        assert!(llm < embed);
        assert!(platform.installer.installed().contains(&"nim/nim-embed".to_string()));

        let ai_tier = summary.result(AI_TIER_STAGE).unwrap();
        assert!(ai_tier.is_success());
        assert_eq!(ai_tier.failed_units().count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_install_failure_halts_run() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();
        platform.installer.fail("milvus/milvus", "timed out waiting for the condition", 3);

        let err = orchestrator(config(dir.path()), &platform).deploy(None).await.unwrap_err();

        assert_eq!(err.stage.as_deref(), Some(DATA_TIER_STAGE));
        assert_eq!(err.summary.state, RunState::Failed(DATA_TIER_STAGE.to_string()));
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("data-tier"));
        assert_eq!(platform.log.count("install:nim/"), 0);
        assert_eq!(platform.log.count("install:alpha/"), 0);
    }

    #[tokio::test]
    async fn test_unresolved_reference_makes_no_external_call() {
        let platform = platform();
        let graph = PipelineBuilder::new("t")
            .stage(
                StageSpec::new(
                    INFRA_STAGE,
                    StageAction::Provision {
                        template: "main.bicep".into(),
                    },
                )
                .with_outputs(["clusterName"]),
            )
            .unwrap()
            .stage(
                StageSpec::new(KUBE_CONTEXT_STAGE, StageAction::ConnectCluster)
                    .with_dependency(INFRA_STAGE)
                    .with_required_param("cluster", "${infra.clusterFqdn}"),
            )
            .unwrap()
            .build()
            .unwrap();
        let store = OutputStore::in_memory(RunIdentity::new());
        let dir = tempfile::tempdir().unwrap();

        let err = orchestrator(config(dir.path()), &platform)
            .run(&graph, &store)
            .await
            .unwrap_err();

        assert!(matches!(err.source, DeployError::UnresolvedReference(_)));
        assert_eq!(platform.log.count("connect:"), 0);
        assert_eq!(store.status(KUBE_CONTEXT_STAGE), Some(StageStatus::Failed));
    }

    #[tokio::test]
    async fn test_provisioning_failure_ignores_tolerated_policy() {
        let platform = platform();
        platform.provisioner.fail(INFRA_STAGE, "QuotaExceeded", 2);
        let graph = PipelineBuilder::new("t")
            .stage(
                StageSpec::new(
                    INFRA_STAGE,
                    StageAction::Provision {
                        template: "main.bicep".into(),
                    },
                )
                .tolerated(),
            )
            .unwrap()
            .build()
            .unwrap();
        let store = OutputStore::in_memory(RunIdentity::new());
        let dir = tempfile::tempdir().unwrap();

        let err = orchestrator(config(dir.path()), &platform)
            .run(&graph, &store)
            .await
            .unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::ProvisioningFailed);
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_tolerated_attach_failure_continues() {
        let platform = platform();
        platform.cluster.fail_attach("AuthorizationFailed");
        let dir = tempfile::tempdir().unwrap();

        let summary = orchestrator(config(dir.path()), &platform).deploy(None).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.tolerated.len(), 1);
        assert_eq!(summary.tolerated[0].stage, ATTACH_REGISTRY_STAGE);
        assert_eq!(summary.tolerated[0].unit, None);
    }

    #[tokio::test]
    async fn test_retry_with_run_id_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let first = platform();
        first.installer.fail("milvus/milvus", "timed out", 1);
        orchestrator(config(dir.path()), &first)
            .deploy(Some("run-1".to_string()))
            .await
            .unwrap_err();

        let second = platform();
        let summary = orchestrator(config(dir.path()), &second)
            .deploy(Some("run-1".to_string()))
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.run_id, "run-1");
        assert_eq!(
            second.log.entries(),
            vec![
                "install:milvus/milvus",
                "install:nim/nim-llm",
                "install:nim/nim-embed",
                "install:nim/nim-rerank",
                "install:alpha/alpha-agent",
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_run_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        let err = orchestrator(config(dir.path()), &platform)
            .deploy(Some("../escape".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err.source, DeployError::InvalidConfig { .. }));
        assert!(platform.log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_halts_run() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();
        platform.jobs.set_phases(vec![JobPhase::Running]);
        let config = DeployConfig {
            load_data_on_deploy: true,
            job_timeout_secs: 300,
            ..config(dir.path())
        };

        let err = orchestrator(config, &platform).deploy(None).await.unwrap_err();

        assert!(matches!(err.source, DeployError::JobTimedOut { waited_secs: 300, .. }));
        assert_eq!(err.exit_code(), 124);
        assert_eq!(err.summary.state, RunState::Failed(LOAD_DATA_STAGE.to_string()));
        assert_eq!(err.summary.count(StageStatus::Succeeded), 9);
    }

    #[tokio::test]
    async fn test_load_data_reuses_latest_run() {
        let dir = tempfile::tempdir().unwrap();
        orchestrator(config(dir.path()), &platform()).deploy(None).await.unwrap();

        let platform = platform();
        let summary = orchestrator(config(dir.path()), &platform).load_data().await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(platform.log.entries(), vec!["submit:alpha-ingest"]);
        let job = &platform.jobs.submitted()[0];
        assert_eq!(job.image, "alpha.azurecr.io/alpha-agent:latest");
        assert_eq!(job.env["MILVUS_HOST"], "milvus.milvus.svc.cluster.local");
        assert_eq!(
            summary.result(LOAD_DATA_STAGE).map(|r| r.status),
            Some(StageStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_load_data_requires_provisioned_state() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        let err = orchestrator(config(dir.path()), &platform).load_data().await.unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::PreconditionMissing);
        assert!(platform.log.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_stage_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("interrupted");

        let err = orchestrator(config(dir.path()), &platform)
            .with_cancellation(cancel)
            .deploy(None)
            .await
            .unwrap_err();

        assert_eq!(err.stage.as_deref(), Some(PROVIDERS_STAGE));
        assert_eq!(err.exit_code(), 130);
        assert!(platform.log.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_tears_down_resource_group() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform();

        let target = orchestrator(config(dir.path()), &platform).destroy().await.unwrap();

        assert_eq!(target.resource_group, "alpha-rg");
        assert_eq!(platform.log.entries(), vec!["teardown:alpha-rg"]);
    }

    #[tokio::test]
    async fn test_status_reports_latest_run() {
        let dir = tempfile::tempdir().unwrap();
        orchestrator(config(dir.path()), &platform()).deploy(None).await.unwrap();

        let platform = platform();
        platform.runner.add(
            "kubectl",
            &["get"],
            CommandOutput::ok(
                r#"{"items": [{"kind": "Deployment", "metadata": {"name": "alpha-agent", "namespace": "alpha"},
                   "spec": {"replicas": 1}, "status": {"readyReplicas": 1}}]}"#,
            ),
        );

        let report = orchestrator(config(dir.path()), &platform).status(false).await.unwrap();

        assert!(report.run_id.is_some());
        assert_eq!(report.stages.get(INFRA_STAGE), Some(&StageStatus::Succeeded));
        assert!(report.units["alpha/alpha-agent"].ready);
        assert_eq!(platform.log.count("provision:"), 0);
    }
}
