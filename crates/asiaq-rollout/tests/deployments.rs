//! End-to-end deployments against the local cloud.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use asiaq_autoscale::CapacitySchedule;
use asiaq_config::{AsiaqConfig, PipelineEntry, PipelineSpec};
use asiaq_core::{DeploymentStrategy, ImageStage, RandomSource, ScriptedRandom, StdRandom};
use asiaq_rollout::{
    DeployFilter, DeployOutcome, Deployment, DeploymentOrchestrator, ExecError, RemoteExec,
    RolloutError,
};
use asiaq_scheduler::{
    Cloud, CloudError, CloudResult, EnvironmentManager, LocalCloud, ProvisioningScheduler,
    RunOptions, StatusProbe,
};
use asiaq_state::{
    AutoscalingGroup, DeploymentAttempt, DeploymentPhase, EnvironmentRegistry, Image, Instance,
    InstanceId, InstanceStatus, LoadBalancerMode, LoadBalancerRegistration, Snapshot, StateStore,
    TestOutcome,
};

const CONFIG: &str = r#"
[asiaq]
default_env_type = "sandbox"
zones = ["zone-a"]
smoke_timeout_secs = 5
smoke_poll_secs = 0
health_timeout_secs = 5
retry_backoff_secs = 0

[envtype.sandbox]
ip_space = "10.8.0.0/16"
vpc_cidr_size = 20

[test]
test_user = "tester"
test_command = "run_tests.sh --quiet"

[hostclass.mhcweb]
elb = "yes"
deployable = "yes"
integration_test = "web_tests"

[hostclass.mhcworker]
deployable = "yes"
deployment_strategy = "classic"

[hostclass.mhcjob]
deployable = "no"
"#;

const PIPELINE: &str = "\
sequence,hostclass,desired_size
1,mhcweb,2
1,mhcworker,1
2,mhcjob,1
";

/// Returns a fixed exit code, or cannot reach the host at all, and records
/// what it was asked to run.
struct ScriptedExec {
    code: Option<i32>,
    calls: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl ScriptedExec {
    fn new(code: i32) -> Self {
        Self {
            code: Some(code),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        Self {
            code: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn run(&self, host: &Instance, user: &str, command: &[String]) -> Result<i32, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.group.clone(), user.to_string(), command.to_vec()));
        self.code.ok_or_else(|| ExecError::Unreachable(host.id.clone()))
    }
}

/// Local cloud that refuses to update any group outside test mode.
struct StableUpdatesFail {
    inner: Arc<LocalCloud>,
}

#[async_trait]
impl Cloud for StableUpdatesFail {
    async fn put_group(&self, group: AutoscalingGroup) -> CloudResult<AutoscalingGroup> {
        if !group.testing {
            return Err(CloudError::Provider(format!("update of {} rejected", group.name)));
        }
        self.inner.put_group(group).await
    }

    async fn find_group(&self, environment: &str, name: &str) -> CloudResult<Option<AutoscalingGroup>> {
        self.inner.find_group(environment, name).await
    }

    async fn list_groups(&self, environment: &str) -> CloudResult<Vec<AutoscalingGroup>> {
        self.inner.list_groups(environment).await
    }

    async fn set_group_image(
        &self,
        environment: &str,
        name: &str,
        image_id: &str,
    ) -> CloudResult<AutoscalingGroup> {
        self.inner.set_group_image(environment, name, image_id).await
    }

    async fn destroy_group(&self, environment: &str, name: &str) -> CloudResult<bool> {
        self.inner.destroy_group(environment, name).await
    }

    async fn list_instances(&self, environment: &str, group: Option<&str>) -> CloudResult<Vec<Instance>> {
        self.inner.list_instances(environment, group).await
    }

    async fn terminate_instances(&self, environment: &str, ids: &[InstanceId]) -> CloudResult<u32> {
        self.inner.terminate_instances(environment, ids).await
    }

    async fn latest_snapshot(&self, hostclass: &str) -> CloudResult<Option<Snapshot>> {
        self.inner.latest_snapshot(hostclass).await
    }

    async fn attach_load_balancer(
        &self,
        environment: &str,
        group: &str,
        registration: LoadBalancerRegistration,
    ) -> CloudResult<()> {
        self.inner.attach_load_balancer(environment, group, registration).await
    }

    async fn load_balancer_healthy(&self, environment: &str, group: &str) -> CloudResult<bool> {
        self.inner.load_balancer_healthy(environment, group).await
    }

    async fn exit_test_mode(&self, environment: &str, group: &str) -> CloudResult<()> {
        self.inner.exit_test_mode(environment, group).await
    }
}

/// Panics on the first draw, poisoning whatever lock it is held under.
struct PanickingRandom;

impl RandomSource for PanickingRandom {
    fn below(&mut self, _bound: u64) -> u64 {
        panic!("random source failed");
    }
}

struct Fixture {
    store: StateStore,
    cloud: Arc<LocalCloud>,
    scheduler: Arc<ProvisioningScheduler>,
    exec: Arc<ScriptedExec>,
    orchestrator: DeploymentOrchestrator,
    pipeline: PipelineSpec,
}

fn image(id: &str, hostclass: &str, stage: ImageStage, created_at: u64) -> Image {
    Image {
        id: id.to_string(),
        hostclass: hostclass.to_string(),
        stage,
        created_at,
    }
}

async fn fixture(config: &str, exit_code: i32) -> Fixture {
    fixture_with_exec(config, ScriptedExec::new(exit_code)).await
}

/// An environment with every pipeline hostclass running its `-1` image.
async fn fixture_with_exec(config: &str, exec: ScriptedExec) -> Fixture {
    let store = StateStore::open_in_memory().unwrap();
    let config = AsiaqConfig::parse(config).unwrap();
    let cloud = Arc::new(LocalCloud::new(store.clone()));
    EnvironmentManager::new(EnvironmentRegistry::new(store.clone()), cloud.clone(), config.clone())
        .create("ci", None, &mut StdRandom::seeded(9), false)
        .unwrap();

    let pipeline = PipelineSpec::parse(PIPELINE).unwrap();
    for hostclass in pipeline.hostclasses() {
        store
            .put_image(&image(&format!("ami-{hostclass}-1"), hostclass, ImageStage::Tested, 1))
            .unwrap();
    }
    let scheduler = Arc::new(ProvisioningScheduler::new(
        cloud.clone(),
        Arc::new(StatusProbe::new(store.clone())),
        store.clone(),
        config,
    ));
    scheduler
        .run(&pipeline, "ci", RunOptions::default())
        .await
        .unwrap();

    let exec = Arc::new(exec);
    let orchestrator = DeploymentOrchestrator::new(
        scheduler.clone(),
        exec.clone(),
        Box::new(ScriptedRandom::new([0, 7, 0xbeef])),
    );
    Fixture {
        store,
        cloud,
        scheduler,
        exec,
        orchestrator,
        pipeline,
    }
}

fn attempted(outcome: DeployOutcome) -> DeploymentAttempt {
    match outcome {
        DeployOutcome::Attempted(attempt) => attempt,
        other => panic!("expected an attempt, got {other:?}"),
    }
}

fn only(hostclass: &str) -> DeployFilter {
    DeployFilter {
        hostclass: Some(hostclass.to_string()),
        ..DeployFilter::default()
    }
}

async fn groups_of(cloud: &LocalCloud, hostclass: &str) -> Vec<AutoscalingGroup> {
    cloud
        .list_groups("ci")
        .await
        .unwrap()
        .into_iter()
        .filter(|g| g.hostclass == hostclass)
        .collect()
}

/// The `mhcweb` production group is untouched: same image, same
/// instances, still registered with and served by its load balancer.
async fn assert_web_stack_intact(f: &Fixture) {
    let groups = groups_of(&f.cloud, "mhcweb").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "ci_mhcweb");
    assert_eq!(groups[0].image_id, "ami-mhcweb-1");
    assert!(!groups[0].testing);
    assert_eq!(
        groups[0].load_balancer,
        Some(LoadBalancerRegistration {
            name: "ci-mhcweb".to_string(),
            mode: LoadBalancerMode::Production,
        })
    );
    assert!(f.cloud.load_balancer_healthy("ci", "ci_mhcweb").await.unwrap());
    let serving = f.cloud.list_instances("ci", Some("ci_mhcweb")).await.unwrap();
    assert_eq!(serving.len(), 2);
    assert!(serving.iter().all(|i| i.image_id == "ami-mhcweb-1"));

    let isolated = f
        .cloud
        .list_groups("ci")
        .await
        .unwrap()
        .into_iter()
        .filter_map(|g| g.load_balancer)
        .filter(|lb| lb.mode == LoadBalancerMode::Isolated)
        .count();
    assert_eq!(isolated, 0);
}

#[tokio::test]
async fn failed_integration_test_keeps_old_stack() {
    let f = fixture(CONFIG, 1).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcweb"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::RolledBack);
    assert_eq!(attempt.smoke, Some(TestOutcome::Passed));
    assert!(matches!(attempt.integration, Some(TestOutcome::Failed { .. })));
    assert_eq!(attempt.new_group.as_deref(), Some("ci_mhcweb_beef"));
    assert!(attempt.history.iter().any(|t| t.phase == DeploymentPhase::Rollback));
    assert!(f.cloud.find_group("ci", "ci_mhcweb_beef").await.unwrap().is_none());
    assert_web_stack_intact(&f).await;

    let calls = f.exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "ci_mhcweb_beef");
    assert_eq!(calls[0].1, "tester");
    assert_eq!(calls[0].2, vec!["run_tests.sh", "--quiet", "web_tests"]);

    assert_eq!(f.store.get_image("ami-mhcweb-2").unwrap().unwrap().stage, ImageStage::Failed);
    let stored = f.store.get_attempt(&attempt.id).unwrap().unwrap();
    assert_eq!(stored, attempt);
}

#[tokio::test]
async fn blue_green_replaces_stable_group() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcweb"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::OldStackDestroyed);
    assert_eq!(attempt.integration, Some(TestOutcome::Passed));
    assert_eq!(attempt.stable_group.as_deref(), Some("ci_mhcweb"));
    let phases: Vec<_> = attempt.history.iter().map(|t| t.phase).collect();
    assert_eq!(
        phases,
        vec![
            DeploymentPhase::Pending,
            DeploymentPhase::NewStackCreated,
            DeploymentPhase::SmokeWait,
            DeploymentPhase::IntegrationRunning,
            DeploymentPhase::IntegrationPassed,
            DeploymentPhase::ExitTestMode,
            DeploymentPhase::AttachToProduction,
            DeploymentPhase::WaitHealthy,
            DeploymentPhase::OldStackDestroyed,
        ]
    );

    assert!(f.cloud.find_group("ci", "ci_mhcweb").await.unwrap().is_none());
    let new = f.cloud.find_group("ci", "ci_mhcweb_beef").await.unwrap().unwrap();
    assert_eq!(new.image_id, "ami-mhcweb-2");
    assert_eq!(new.desired_size, 2);
    assert!(!new.testing);
    let lb = new.load_balancer.unwrap();
    assert_eq!(lb.name, "ci-mhcweb");
    assert_eq!(lb.mode, LoadBalancerMode::Production);

    assert_eq!(f.store.get_image("ami-mhcweb-2").unwrap().unwrap().stage, ImageStage::Tested);
}

#[tokio::test]
async fn nothing_to_test_when_catalog_is_current() {
    let f = fixture(CONFIG, 0).await;
    let outcome = f
        .orchestrator
        .deploy_test("ci", &f.pipeline, &DeployFilter::default())
        .await
        .unwrap();
    assert_eq!(outcome, DeployOutcome::Nothing);
}

#[tokio::test]
async fn dry_run_names_the_image_only() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();
    let filter = DeployFilter {
        dry_run: true,
        ..DeployFilter::default()
    };
    let outcome = f.orchestrator.deploy_test("ci", &f.pipeline, &filter).await.unwrap();
    assert_eq!(
        outcome,
        DeployOutcome::Planned {
            hostclass: "mhcweb".to_string(),
            image_id: "ami-mhcweb-2".to_string(),
        }
    );
    assert_eq!(f.cloud.list_groups("ci").await.unwrap().len(), 3);
    assert!(f.exec.calls().is_empty());
}

#[tokio::test]
async fn classic_update_swaps_image_in_place() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcworker-2", "mhcworker", ImageStage::Tested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_update("ci", &f.pipeline, &DeployFilter::default())
            .await
            .unwrap(),
    );
    assert_eq!(attempt.strategy, DeploymentStrategy::Classic);
    assert_eq!(attempt.phase, DeploymentPhase::Completed);
    let group = f.cloud.find_group("ci", "ci_mhcworker").await.unwrap().unwrap();
    assert_eq!(group.image_id, "ami-mhcworker-2");
    let instances = f.cloud.list_instances("ci", Some("ci_mhcworker")).await.unwrap();
    assert!(instances.iter().all(|i| i.image_id == "ami-mhcworker-2"));
}

#[tokio::test]
async fn classic_smoke_failure_is_a_mixed_fleet() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcworker-2", "mhcworker", ImageStage::Tested, 2))
        .unwrap();
    f.cloud.boot_into("mhcworker", InstanceStatus::Failed);

    let attempt = attempted(
        f.orchestrator
            .deploy_update("ci", &f.pipeline, &only("mhcworker"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::MixedFleet);
    assert!(matches!(attempt.smoke, Some(TestOutcome::Failed { .. })));
    assert!(attempt.error.is_some());
}

#[tokio::test]
async fn non_deployable_image_is_validated_without_replacement() {
    let f = fixture(CONFIG, 0).await;
    let before = f.cloud.list_instances("ci", Some("ci_mhcjob")).await.unwrap();
    f.store
        .put_image(&image("ami-mhcjob-2", "mhcjob", ImageStage::Untested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcjob"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::Validated);
    assert_eq!(attempt.integration, Some(TestOutcome::Skipped));

    let jobs: Vec<_> = f
        .cloud
        .list_groups("ci")
        .await
        .unwrap()
        .into_iter()
        .filter(|g| g.hostclass == "mhcjob")
        .collect();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].image_id, "ami-mhcjob-2");
    let after = f.cloud.list_instances("ci", Some("ci_mhcjob")).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(f.store.get_image("ami-mhcjob-2").unwrap().unwrap().stage, ImageStage::Tested);
}

#[tokio::test]
async fn update_skips_non_deployable_hostclasses() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcjob-2", "mhcjob", ImageStage::Tested, 2))
        .unwrap();
    let outcome = f
        .orchestrator
        .deploy_update("ci", &f.pipeline, &DeployFilter::default())
        .await
        .unwrap();
    assert_eq!(outcome, DeployOutcome::Nothing);
}

#[tokio::test]
async fn integration_test_without_command_is_rejected_up_front() {
    let config = CONFIG.replace("test_command = \"run_tests.sh --quiet\"\n", "");
    let f = fixture(&config, 0).await;
    let groups_before = f.cloud.list_groups("ci").await.unwrap().len();

    let err = f
        .orchestrator
        .deploy("ci", &PipelineEntry::new("mhcweb"), "ami-mhcweb-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::Misconfigured { .. }));
    assert_eq!(f.cloud.list_groups("ci").await.unwrap().len(), groups_before);
    assert!(f.store.list_attempts("ci").unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_attempt_is_rolled_back() {
    let f = fixture(CONFIG, 0).await;
    let mut leftover = f.cloud.find_group("ci", "ci_mhcweb").await.unwrap().unwrap();
    leftover.name = "ci_mhcweb_dead".to_string();
    leftover.testing = true;
    leftover.min_size = 0;
    leftover.desired_size = 1;
    leftover.max_size = 1;
    f.cloud.put_group(leftover).await.unwrap();

    let mut deployment = Deployment::new(
        "dep-interrupted",
        "ci",
        "mhcweb",
        DeploymentStrategy::BlueGreen,
        "ami-mhcweb-1",
        Some("ci_mhcweb".to_string()),
    );
    deployment.set_new_group("ci_mhcweb_dead");
    deployment.advance().unwrap();
    deployment.advance().unwrap();
    f.store.put_attempt(deployment.attempt()).unwrap();

    let recovered = f.orchestrator.recover("ci").await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].phase, DeploymentPhase::RolledBack);
    assert!(f.cloud.find_group("ci", "ci_mhcweb_dead").await.unwrap().is_none());
    assert!(f.cloud.find_group("ci", "ci_mhcweb").await.unwrap().is_some());
    assert!(f.orchestrator.recover("ci").await.unwrap().is_empty());
}

#[tokio::test]
async fn scheduled_sizes_carry_into_new_stack() {
    let f = fixture(CONFIG, 0).await;
    let mut entry = PipelineEntry::new("mhcweb");
    entry.max_size = Some(CapacitySchedule::constant(5));
    let attempt = f
        .orchestrator
        .deploy("ci", &entry, "ami-mhcweb-1", Some(DeploymentStrategy::BlueGreen))
        .await
        .unwrap();
    assert_eq!(attempt.phase, DeploymentPhase::OldStackDestroyed);
    let group = f
        .cloud
        .find_group("ci", attempt.new_group.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.max_size, 5);
    assert_eq!(group.desired_size, 2);
}

#[tokio::test]
async fn unreachable_test_host_fails_without_retry() {
    let f = fixture_with_exec(CONFIG, ScriptedExec::unreachable()).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcweb"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::RolledBack);
    match &attempt.integration {
        Some(TestOutcome::Failed { reason }) => assert!(reason.contains("could not reach"), "{reason}"),
        other => panic!("expected a failed integration test, got {other:?}"),
    }
    assert_eq!(f.exec.calls().len(), 1);
    assert!(f.cloud.find_group("ci", "ci_mhcweb_beef").await.unwrap().is_none());
    assert_web_stack_intact(&f).await;
    assert_eq!(f.store.get_image("ami-mhcweb-2").unwrap().unwrap().stage, ImageStage::Failed);
}

#[tokio::test]
async fn unhealthy_load_balancer_rolls_back() {
    let config = CONFIG
        .replace("health_timeout_secs = 5", "health_timeout_secs = 0")
        .replace("integration_test = \"web_tests\"", "smoke_test = \"no\"");
    let f = fixture(&config, 0).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();
    f.cloud.boot_into("mhcweb", InstanceStatus::Pending);

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcweb"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::RolledBack);
    assert_eq!(attempt.smoke, Some(TestOutcome::Skipped));
    assert!(attempt.history.iter().any(|t| t.phase == DeploymentPhase::WaitHealthy));
    assert!(attempt.error.as_deref().unwrap().contains("not healthy"));
    assert!(f.cloud.find_group("ci", "ci_mhcweb_beef").await.unwrap().is_none());
    assert_web_stack_intact(&f).await;
}

#[tokio::test]
async fn smoke_timeout_on_new_stack_rolls_back() {
    let config = CONFIG.replace("smoke_timeout_secs = 5", "smoke_timeout_secs = 1");
    let f = fixture(&config, 0).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();
    f.cloud.boot_into("mhcweb", InstanceStatus::Pending);

    let attempt = attempted(
        f.orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcweb"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::RolledBack);
    assert!(matches!(attempt.smoke, Some(TestOutcome::Failed { .. })));
    assert_eq!(attempt.integration, None);
    assert!(f.exec.calls().is_empty());
    assert_web_stack_intact(&f).await;
}

fn with_worker_test(config: &str) -> String {
    config.replace(
        "deployment_strategy = \"classic\"\n",
        "deployment_strategy = \"classic\"\nintegration_test = \"worker_tests\"\n",
    )
}

#[tokio::test]
async fn classic_update_runs_integration_test_after_smoke() {
    let f = fixture(&with_worker_test(CONFIG), 0).await;
    f.store
        .put_image(&image("ami-mhcworker-2", "mhcworker", ImageStage::Tested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_update("ci", &f.pipeline, &only("mhcworker"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::Completed);
    assert_eq!(attempt.integration, Some(TestOutcome::Passed));
    let phases: Vec<_> = attempt.history.iter().map(|t| t.phase).collect();
    assert_eq!(
        phases,
        vec![
            DeploymentPhase::Pending,
            DeploymentPhase::ImageUpdated,
            DeploymentPhase::SmokeWait,
            DeploymentPhase::IntegrationRunning,
            DeploymentPhase::IntegrationPassed,
            DeploymentPhase::Completed,
        ]
    );

    let calls = f.exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "ci_mhcworker");
    assert_eq!(calls[0].2, vec!["run_tests.sh", "--quiet", "worker_tests"]);
}

#[tokio::test]
async fn classic_integration_failure_is_a_mixed_fleet() {
    let f = fixture(&with_worker_test(CONFIG), 1).await;
    f.store
        .put_image(&image("ami-mhcworker-2", "mhcworker", ImageStage::Tested, 2))
        .unwrap();

    let attempt = attempted(
        f.orchestrator
            .deploy_update("ci", &f.pipeline, &only("mhcworker"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::MixedFleet);
    assert_eq!(attempt.smoke, Some(TestOutcome::Passed));
    assert!(matches!(attempt.integration, Some(TestOutcome::Failed { .. })));
    assert!(attempt.error.as_deref().unwrap().contains("worker_tests exited with 1"));
    assert_eq!(f.exec.calls().len(), 1);

    // No way back: the group keeps the new image.
    let group = f.cloud.find_group("ci", "ci_mhcworker").await.unwrap().unwrap();
    assert_eq!(group.image_id, "ami-mhcworker-2");
    let stored = f.store.get_attempt(&attempt.id).unwrap().unwrap();
    assert_eq!(stored.phase, DeploymentPhase::MixedFleet);
}

#[tokio::test]
async fn failed_stable_update_rolls_back_validation() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcjob-2", "mhcjob", ImageStage::Untested, 2))
        .unwrap();
    let scheduler = Arc::new(ProvisioningScheduler::new(
        Arc::new(StableUpdatesFail {
            inner: f.cloud.clone(),
        }),
        Arc::new(StatusProbe::new(f.store.clone())),
        f.store.clone(),
        AsiaqConfig::parse(CONFIG).unwrap(),
    ));
    let orchestrator = DeploymentOrchestrator::new(
        scheduler,
        f.exec.clone(),
        Box::new(ScriptedRandom::new([0, 7, 0xbeef])),
    );

    let attempt = attempted(
        orchestrator
            .deploy_test("ci", &f.pipeline, &only("mhcjob"))
            .await
            .unwrap(),
    );
    assert_eq!(attempt.phase, DeploymentPhase::RolledBack);
    assert!(!attempt.history.iter().any(|t| t.phase == DeploymentPhase::Validated));
    assert!(attempt.error.as_deref().unwrap().contains("rejected"));

    let jobs = groups_of(&f.cloud, "mhcjob").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "ci_mhcjob");
    assert_eq!(jobs[0].image_id, "ami-mhcjob-1");
    assert_eq!(f.store.get_image("ami-mhcjob-2").unwrap().unwrap().stage, ImageStage::Failed);
}

#[tokio::test]
async fn poisoned_random_source_is_an_error() {
    let f = fixture(CONFIG, 0).await;
    f.store
        .put_image(&image("ami-mhcweb-2", "mhcweb", ImageStage::Untested, 2))
        .unwrap();
    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        f.scheduler.clone(),
        f.exec.clone(),
        Box::new(PanickingRandom),
    ));
    let filter = DeployFilter {
        dry_run: true,
        ..DeployFilter::default()
    };

    let worker = Arc::clone(&orchestrator);
    let pipeline = f.pipeline.clone();
    let worker_filter = filter.clone();
    let panicked = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(worker.deploy_test("ci", &pipeline, &worker_filter))
    })
    .join();
    assert!(panicked.is_err());

    let err = orchestrator
        .deploy_test("ci", &f.pipeline, &filter)
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::RandomSourcePoisoned));
    let err = orchestrator
        .deploy("ci", &PipelineEntry::new("mhcweb"), "ami-mhcweb-2", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::RandomSourcePoisoned));
    assert!(f.store.list_attempts("ci").unwrap().is_empty());
}
