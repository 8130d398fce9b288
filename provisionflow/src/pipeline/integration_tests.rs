//! End-to-end tests for provisioning and reset runs.

#[cfg(test)]
mod tests {
    use crate::config::EnvironmentConfig;
    use crate::core::{StageOutcome, StageState};
    use crate::credentials::SecretRef;
    use crate::errors::ErrorKind;
    use crate::events::{CollectingEventSink, EventType};
    use crate::pipeline::{
        Orchestrator, Pipeline, PipelineBuilder, Provisioner, ResetEngine, RetryPolicy, Runtime,
        EXIT_PRECONDITION, EXIT_SECRET, EXIT_SUCCESS,
    };
    use crate::ports::Identifier;
    use crate::stages::{DatabaseStage, StageBaseExt};
    use crate::testing::{
        assert_all_skipped, assert_failed_at, assert_not_attempted, assert_outcomes,
        assert_run_succeeded, ApplyStep, CallLog, ChartEffects, ScriptedStage,
        SimulatedEnvironment,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const ADMIN_PASSWORD: &str = "admin-pw";

    fn fast_config() -> EnvironmentConfig {
        let mut config = EnvironmentConfig::new("it").with_connector("conn-oeg-demo");
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.readiness.interval_secs = 1;
        config.readiness.max_polls = 3;
        config.readiness.budget_secs = 5;
        config.reset.interval_secs = 1;
        config.reset.max_polls = 3;
        config.reset.convergence_secs = 5;
        config
    }

    /// An empty cluster whose charts create what the real ones would.
    fn environment() -> Arc<SimulatedEnvironment> {
        let env = Arc::new(SimulatedEnvironment::new());
        env.on_install(
            "common-srvs",
            ChartEffects::postgres(&SimulatedEnvironment::default_access(), ADMIN_PASSWORD),
        );
        env.on_install(
            "demo-dataspace-s1",
            ChartEffects::new()
                .workload("demo-registration-service", 1)
                .table("demo_rs", "public", "edc_participant"),
        );
        env.on_install(
            "conn-oeg-demo-demo",
            ChartEffects::new()
                .workload("conn-oeg-demo", 1)
                .participant("demo_rs", "conn-oeg-demo"),
        );
        env
    }

    fn scripted_runtime() -> (Runtime, Arc<CollectingEventSink>) {
        let env = Arc::new(SimulatedEnvironment::new());
        let sink = Arc::new(CollectingEventSink::new());
        (Runtime::new(env.collaborators()).with_event_sink(sink.clone()), sink)
    }

    fn quick_retries(attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2)
    }

    fn chain(log: &Arc<CallLog>, names: &[&str]) -> Pipeline {
        let mut builder = PipelineBuilder::new("chain");
        let mut previous: Option<&str> = None;
        for &name in names {
            let mut stage = ScriptedStage::new(name, log.clone());
            if let Some(dep) = previous {
                stage = stage.after([dep]);
            }
            builder = builder.add(stage).unwrap();
            previous = Some(name);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let (runtime, _) = scripted_runtime();
        let log = CallLog::new();
        let pipeline = chain(&log, &["namespace", "secret", "database", "release"]);
        let orchestrator = Orchestrator::new(runtime);

        let first = orchestrator.run(&pipeline).await;
        assert_run_succeeded(&first);
        assert_eq!(log.calls_of("apply").len(), 4);

        log.clear();
        let second = orchestrator.run(&pipeline).await;
        assert_all_skipped(&second);
        assert!(log.calls_of("apply").is_empty());
        assert_eq!(second.exit_code(), EXIT_SUCCESS);
    }

    #[tokio::test]
    async fn test_dependents_never_apply_after_failure() {
        let (runtime, _) = scripted_runtime();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("ordering")
            .add(ScriptedStage::new("database", log.clone()).script([ApplyStep::Reject]))
            .unwrap()
            .add(ScriptedStage::new("release", log.clone()).after(["database"]))
            .unwrap()
            .add(ScriptedStage::new("rollout", log.clone()).after(["release"]))
            .unwrap()
            .build()
            .unwrap();

        let report = Orchestrator::new(runtime).run(&pipeline).await;
        assert_failed_at(&report, "database", ErrorKind::ApplyFailed);
        assert_not_attempted(&report, &["release", "rollout"]);
        assert_eq!(log.count("release", "apply"), 0);
        assert_eq!(log.count("rollout", "is_satisfied"), 0);
        assert!(!report.first_failure.unwrap().transient);
    }

    #[tokio::test]
    async fn test_precondition_failure_stops_the_run() {
        let (runtime, sink) = scripted_runtime();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("fail-fast")
            .add(ScriptedStage::new("namespace", log.clone()))
            .unwrap()
            .add(
                ScriptedStage::new("database", log.clone())
                    .after(["namespace"])
                    .unmet("pod/common-srvs/common-srvs-postgresql-0 is not reachable"),
            )
            .unwrap()
            .add(ScriptedStage::new("release", log.clone()).after(["database"]))
            .unwrap()
            .build()
            .unwrap();

        let report = Orchestrator::new(runtime).run(&pipeline).await;
        assert_outcomes(
            &report,
            &[
                ("namespace", StageOutcome::Succeeded),
                ("database", StageOutcome::PreconditionFailed),
            ],
        );
        assert_eq!(report.exit_code(), EXIT_PRECONDITION);
        assert!(report
            .first_failure
            .as_ref()
            .unwrap()
            .message
            .contains("common-srvs-postgresql-0"));
        assert!(log.calls().iter().all(|call| !call.starts_with("release:")));
        assert_eq!(log.count("database", "apply"), 0);
        assert!(sink.types().contains(&EventType::StagePreconditionFailed));
    }

    #[tokio::test]
    async fn test_reset_twice_is_all_absent() {
        let (runtime, _) = scripted_runtime();
        let log = CallLog::new();
        let pipeline = chain(&log, &["namespace", "secret", "database"]);
        Orchestrator::new(runtime.clone()).run(&pipeline).await;

        let engine = ResetEngine::new(runtime).with_teardown_policy(quick_retries(2));
        let first = engine.reset(&pipeline).await;
        assert_run_succeeded(&first);
        assert_eq!(
            log.calls_of("teardown"),
            vec!["database:teardown", "secret:teardown", "namespace:teardown"]
        );

        log.clear();
        let second = engine.reset(&pipeline).await;
        assert_all_skipped(&second);
        assert!(log.calls_of("teardown").is_empty());
        assert!(second
            .stages
            .iter()
            .all(|result| result.detail.as_deref() == Some("already absent")));
    }

    #[tokio::test]
    async fn test_apply_bounded_by_attempts_plus_fallback() {
        let (runtime, sink) = scripted_runtime();
        let log = CallLog::new();
        let policy = quick_retries(3).with_fallback(
            crate::pipeline::FallbackPolicy::new(std::time::Duration::from_secs(5))
                .with_teardown_first(false),
        );
        let stage = ScriptedStage::new("release", log.clone())
            .with_policy(policy)
            .script(std::iter::repeat(ApplyStep::Fail).take(10));
        let pipeline = PipelineBuilder::new("bound").add(stage).unwrap().build().unwrap();

        let report = Orchestrator::new(runtime).run(&pipeline).await;
        let result = report.result("release").unwrap();
        assert_eq!(result.outcome, StageOutcome::Failed);
        assert_eq!(result.attempts, 4);
        assert!(result.fallback_used);
        assert_eq!(log.count("release", "apply"), 3);
        assert_eq!(log.count("release", "fallback"), 1);
        assert!(report.first_failure.unwrap().fallback_attempted);
        assert_eq!(
            sink.for_stage("release")
                .iter()
                .filter(|t| **t == EventType::StageRetrying)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_apply() {
        let (runtime, _) = scripted_runtime();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("secrets")
            .add(
                ScriptedStage::new("database", log.clone())
                    .requiring(SecretRef::new("demo", "demo-rs-db-credentials", "password")),
            )
            .unwrap()
            .add(ScriptedStage::new("release", log.clone()).after(["database"]))
            .unwrap()
            .build()
            .unwrap();

        let report = Orchestrator::new(runtime).run(&pipeline).await;
        assert_failed_at(&report, "database", ErrorKind::SecretUnavailable);
        assert_eq!(report.exit_code(), EXIT_SECRET);
        assert_eq!(log.count("database", "apply"), 0);
        assert_eq!(log.count("release", "precondition"), 0);
        assert!(report
            .first_failure
            .unwrap()
            .message
            .contains("demo/demo-rs-db-credentials#password"));
    }

    #[tokio::test]
    async fn test_database_in_place_runs_no_sql() {
        let env = Arc::new(SimulatedEnvironment::new());
        let access = SimulatedEnvironment::default_access();
        env.seed_postgres(&access, ADMIN_PASSWORD);
        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db-credentials", &[("password", "rs-pw")]);
        env.seed_role("demo_rsusr", "rs-pw");
        env.seed_database("demo_rs", "demo_rsusr");

        let pipeline = PipelineBuilder::new("database")
            .add(
                DatabaseStage::new(
                    "rs-database",
                    access.clone(),
                    Identifier::new("demo_rs").unwrap(),
                    Identifier::new("demo_rsusr").unwrap(),
                    SecretRef::new("demo", "demo-rs-db-credentials", "password"),
                )
                .with_retry_policy(quick_retries(1)),
            )
            .unwrap()
            .build()
            .unwrap();
        let runtime = Runtime::new(env.collaborators()).with_database_access(access);

        let report = Orchestrator::new(runtime).run(&pipeline).await;
        assert_outcomes(&report, &[("rs-database", StageOutcome::Skipped)]);
        assert!(env.mutations().iter().all(|m| !m.starts_with("sql ")));
    }

    #[tokio::test]
    async fn test_hooks_timeout_falls_back_to_no_hooks_install() {
        let env = environment();
        env.set_hooks_hang(true);
        let sink = Arc::new(CollectingEventSink::new());
        let provisioner = Provisioner::new(&fast_config(), env.collaborators())
            .unwrap()
            .with_event_sink(sink.clone());

        let report = provisioner.run("common-services").await.unwrap();
        assert_run_succeeded(&report);

        let release = report.result("common-release").unwrap();
        assert_eq!(release.outcome, StageOutcome::Retried);
        assert!(release.fallback_used);
        assert_eq!(release.attempts, 2);
        assert!(release.transitions.contains(&StageState::Retrying));
        assert!(release.transitions.contains(&StageState::FallbackApplying));
        assert_eq!(release.transitions.last(), Some(&StageState::Succeeded));

        let helm: Vec<String> = env
            .mutations()
            .into_iter()
            .filter(|m| m.starts_with("helm "))
            .collect();
        assert_eq!(
            helm,
            vec![
                "helm install common-srvs/common-srvs hooks=true",
                "helm uninstall common-srvs/common-srvs",
                "helm install common-srvs/common-srvs hooks=false",
            ]
        );
        assert!(sink.for_stage("common-release").contains(&EventType::StageFallback));
        assert_eq!(report.outcome("postgres-ready"), Some(StageOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_rotated_password_restarts_registration_service() {
        let env = environment();
        let provisioner = Provisioner::new(&fast_config(), env.collaborators()).unwrap();
        assert_run_succeeded(&provisioner.run("common-services").await.unwrap());

        let first = provisioner.run("dataspace").await.unwrap();
        assert_run_succeeded(&first);
        assert_eq!(first.outcome("registration-rollout"), Some(StageOutcome::Succeeded));
        let restart = "cluster restart deployment/demo/demo-registration-service".to_string();
        assert!(env.mutations().contains(&restart));

        env.seed_secret("demo", "demo-rs-db-credentials", &[("password", "rotated-pw")]);
        env.clear_mutations();
        let second = provisioner.run("dataspace").await.unwrap();
        assert_run_succeeded(&second);
        assert_eq!(second.outcome("runtime-config"), Some(StageOutcome::Succeeded));
        assert_eq!(second.outcome("registration-rollout"), Some(StageOutcome::Succeeded));
        assert!(env.mutations().contains(&restart), "{:?}", env.mutations());
        assert_eq!(
            env.secret_value(
                "demo",
                "demo-registration-service-secret",
                "SPRING_DATASOURCE_PASSWORD"
            ),
            Some("rotated-pw".to_string())
        );

        env.clear_mutations();
        assert_all_skipped(&provisioner.run("dataspace").await.unwrap());
        assert!(env.mutations().is_empty(), "{:?}", env.mutations());
    }

    #[tokio::test]
    async fn test_connector_without_registry_mutates_nothing() {
        let env = environment();
        let provisioner = Provisioner::new(&fast_config(), env.collaborators()).unwrap();
        assert_run_succeeded(&provisioner.run("common-services").await.unwrap());
        env.clear_mutations();

        let report = provisioner.run("connector-conn-oeg-demo").await.unwrap();
        assert_outcomes(&report, &[("credentials", StageOutcome::PreconditionFailed)]);
        assert_not_attempted(&report, &["database", "release", "registration", "verification"]);
        assert_eq!(report.exit_code(), EXIT_PRECONDITION);
        assert!(report
            .first_failure
            .unwrap()
            .message
            .contains("edc_participant"));
        assert!(env.mutations().is_empty(), "{:?}", env.mutations());
    }

    #[tokio::test]
    async fn test_vault_and_values_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("init-keys-vault.json");
        std::fs::write(&keys, r#"{"unseal_keys_hex":["k1"],"root_token":"root-tok"}"#).unwrap();
        let values = dir.path().join("step-1").join("values-demo.yaml");
        let mut config = fast_config();
        config.common_services.vault = Some(crate::config::VaultConfig {
            pod: "common-srvs-vault-0".to_string(),
            keys_file: keys,
            kv_mount: "secret".to_string(),
        });
        config.dataspace.rendered_values = Some(values.clone());

        let env = environment();
        env.on_install(
            "common-srvs",
            ChartEffects::postgres(&SimulatedEnvironment::default_access(), ADMIN_PASSWORD)
                .workload("common-srvs-vault", 1),
        );
        env.seed_vault("common-srvs", "common-srvs-vault-0", &["k1"], 1, "root-tok");
        let provisioner = Provisioner::new(&config, env.collaborators()).unwrap();

        assert_run_succeeded(&provisioner.run("common-services").await.unwrap());
        assert_eq!(env.vault_mounts("common-srvs", "common-srvs-vault-0"), vec!["secret/"]);
        assert_run_succeeded(&provisioner.run("dataspace").await.unwrap());
        let rendered = std::fs::read_to_string(&values).unwrap();
        assert!(rendered.contains("existingSecret: demo-rs-db-credentials"));
        assert!(!rendered.contains(&env.secret_value("demo", "demo-rs-db-credentials", "password").unwrap()));

        env.seal_vault("common-srvs", "common-srvs-vault-0");
        let rerun = provisioner.run("common-services").await.unwrap();
        assert_eq!(rerun.outcome("vault"), Some(StageOutcome::Succeeded));
        assert_eq!(rerun.outcome("common-release"), Some(StageOutcome::Skipped));

        for name in ["dataspace", "common-services"] {
            assert_run_succeeded(&provisioner.reset(name).await.unwrap());
        }
        assert!(!values.exists());
        assert!(env
            .mutations()
            .contains(&"vault disable vault/common-srvs/common-srvs-vault-0 secret".to_string()));

        env.clear_mutations();
        for name in ["dataspace", "common-services"] {
            assert_all_skipped(&provisioner.reset(name).await.unwrap());
        }
        assert!(env.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_reset_of_torn_down_environment_is_a_no_op() {
        let env = environment();
        let provisioner = Provisioner::new(&fast_config(), env.collaborators()).unwrap();

        for name in ["connector-conn-oeg-demo", "dataspace", "common-services"] {
            let report = provisioner.reset(name).await.unwrap();
            assert_all_skipped(&report);
            assert_eq!(report.exit_code(), EXIT_SUCCESS);
        }
        assert!(env.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_full_environment_lifecycle() {
        let env = environment();
        let provisioner = Provisioner::new(&fast_config(), env.collaborators()).unwrap();
        let order = ["common-services", "dataspace", "connector-conn-oeg-demo"];

        for name in order {
            let report = provisioner.run(name).await.unwrap();
            assert_run_succeeded(&report);
        }
        assert!(env.has_database("demo_rs"));
        assert!(env.has_role("conn_oeg_demo"));
        assert_eq!(
            env.config_value(
                "demo",
                "demo-registration-service-config",
                "SPRING_DATASOURCE_USERNAME"
            ),
            Some("demo_rsusr".to_string())
        );
        let password = env
            .secret_value("demo", "demo-rs-db-credentials", "password")
            .unwrap();
        assert!(!password.is_empty());
        assert_eq!(
            env.secret_value(
                "demo",
                "demo-registration-service-secret",
                "SPRING_DATASOURCE_PASSWORD"
            ),
            Some(password)
        );

        env.clear_mutations();
        for name in order {
            let report = provisioner.run(name).await.unwrap();
            assert_all_skipped(&report);
        }
        assert!(env.mutations().is_empty(), "{:?}", env.mutations());

        for name in order.iter().rev() {
            let report = provisioner.reset(name).await.unwrap();
            assert_run_succeeded(&report);
        }
        assert!(!env.has_database("demo_rs"));
        assert!(!env.has_role("demo_rsusr"));
        assert!(!env.has_database("conn_oeg_demo"));

        env.clear_mutations();
        for name in order.iter().rev() {
            let report = provisioner.reset(name).await.unwrap();
            assert_all_skipped(&report);
        }
        assert!(env.mutations().is_empty());
    }
}
