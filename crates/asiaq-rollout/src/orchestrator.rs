//! DeploymentOrchestrator: drives deployment attempts against the cloud.
//!
//! Every phase change is persisted before the next action starts, so an
//! interrupted attempt can be found and compensated later. Blue/green never
//! touches the stable group until the new one is healthy in production;
//! a failure anywhere before that destroys only the new group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use asiaq_config::{HostclassConfig, PipelineEntry, PipelineSpec, Settings};
use asiaq_core::{DeploymentStrategy, ImageStage, RandomSource};
use asiaq_scheduler::{
    ProvisioningScheduler, RunOptions, launch, production_group, snap_to_range,
};
use asiaq_state::{
    AutoscalingGroup, DeploymentAttempt, DeploymentPhase, InstanceStatus, LoadBalancerMode,
    LoadBalancerRegistration, TestOutcome, group_name,
};

use crate::controller::Deployment;
use crate::error::{RolloutError, RolloutResult};
use crate::remote::RemoteExec;
use crate::selection::{pick, test_candidates, update_candidates};

/// How an integration test is run for a hostclass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationPlan {
    pub test: String,
    pub command: Vec<String>,
    pub user: String,
    /// Hostclass whose instances run the test; the new group itself when unset.
    pub test_hostclass: Option<String>,
}

/// What a `deploy test` or `deploy update` run did.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
    /// No image qualified.
    Nothing,
    /// Dry run: the image that would have been deployed.
    Planned { hostclass: String, image_id: String },
    Attempted(DeploymentAttempt),
}

/// Filters for `deploy test` and `deploy update`.
#[derive(Debug, Clone, Default)]
pub struct DeployFilter {
    pub hostclass: Option<String>,
    pub ami: Option<String>,
    pub dry_run: bool,
}

/// Everything an attempt needs that does not change while it runs.
struct Context<'a> {
    environment: &'a str,
    settings: Settings,
    hostclass: HostclassConfig,
    stable: Option<AutoscalingGroup>,
    integration: Option<IntegrationPlan>,
    smoke_test: bool,
}

pub struct DeploymentOrchestrator {
    scheduler: Arc<ProvisioningScheduler>,
    remote: Arc<dyn RemoteExec>,
    rng: Mutex<Box<dyn RandomSource>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        scheduler: Arc<ProvisioningScheduler>,
        remote: Arc<dyn RemoteExec>,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            scheduler,
            remote,
            rng: Mutex::new(rng),
        }
    }

    fn draw(&self, bound: u64) -> RolloutResult<u64> {
        let mut rng = self.rng.lock().map_err(|_| RolloutError::RandomSourcePoisoned)?;
        Ok(rng.below(bound))
    }

    fn persist(&self, deployment: &Deployment) -> RolloutResult<()> {
        self.scheduler.state().put_attempt(deployment.attempt())?;
        Ok(())
    }

    fn step(&self, deployment: &mut Deployment) -> RolloutResult<DeploymentPhase> {
        let phase = deployment.advance()?;
        self.persist(deployment)?;
        Ok(phase)
    }

    /// Integration test settings for `hostclass`, if it has a test.
    pub fn integration_plan(
        &self,
        hostclass: &HostclassConfig,
        entry: &PipelineEntry,
        settings: &Settings,
    ) -> RolloutResult<Option<IntegrationPlan>> {
        let Some(test) = entry
            .integration_test
            .clone()
            .or_else(|| hostclass.integration_test.clone())
        else {
            return Ok(None);
        };
        let command: Vec<String> = hostclass
            .test
            .command
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            return Err(RolloutError::Misconfigured {
                hostclass: hostclass.name.clone(),
                reason: format!("integration test {test} set but no test_command"),
            });
        }
        Ok(Some(IntegrationPlan {
            test,
            command,
            user: hostclass
                .test
                .user
                .clone()
                .unwrap_or_else(|| settings.ssh_user.clone()),
            test_hostclass: hostclass.test.hostclass.clone(),
        }))
    }

    /// Deploy `image_id` to the hostclass of `entry`.
    ///
    /// Pre-flight problems (configuration, a classic deploy with nothing to
    /// update) are errors. Once an attempt has started, its outcome, success
    /// or not, is returned as the final attempt record.
    pub async fn deploy(
        &self,
        environment: &str,
        entry: &PipelineEntry,
        image_id: &str,
        strategy: Option<DeploymentStrategy>,
    ) -> RolloutResult<DeploymentAttempt> {
        let config = self.scheduler.config();
        let settings = config.settings(Some(environment))?;
        let hostclass = config.hostclass(&entry.hostclass, Some(environment))?;
        let strategy = strategy.unwrap_or(hostclass.deployment_strategy);
        let deployable = entry.deployable.unwrap_or(hostclass.deployable);
        let integration = self.integration_plan(&hostclass, entry, &settings)?;
        let stable = production_group(self.scheduler.cloud().as_ref(), environment, &entry.hostclass).await?;
        let smoke_test = entry.smoke_test.unwrap_or(hostclass.smoke_test);

        let id = format!("dep-{:012x}", self.draw(1 << 48)?);
        info!(
            attempt = %id,
            %environment,
            hostclass = %entry.hostclass,
            image = %image_id,
            %strategy,
            deployable,
            "starting deployment"
        );

        let ctx = Context {
            environment,
            settings,
            hostclass,
            stable,
            integration,
            smoke_test,
        };
        if !deployable {
            return self.blue_green(&id, entry, image_id, &ctx, true).await;
        }
        match strategy {
            DeploymentStrategy::BlueGreen => self.blue_green(&id, entry, image_id, &ctx, false).await,
            DeploymentStrategy::Classic => self.classic(&id, image_id, &ctx).await,
        }
    }

    // ── Blue/green ─────────────────────────────────────────────────

    async fn blue_green(
        &self,
        id: &str,
        entry: &PipelineEntry,
        image_id: &str,
        ctx: &Context<'_>,
        validate_only: bool,
    ) -> RolloutResult<DeploymentAttempt> {
        let suffix = format!("{:04x}", self.draw(1 << 16)?);
        let new_group = self.new_stack(entry, image_id, ctx, &suffix).await?;
        let new_name = new_group.name.clone();

        let mut deployment = Deployment::new(
            id,
            ctx.environment,
            &entry.hostclass,
            DeploymentStrategy::BlueGreen,
            image_id,
            ctx.stable.as_ref().map(|g| g.name.clone()),
        );
        deployment.set_new_group(&new_name);
        self.persist(&deployment)?;

        let result = self
            .run_blue_green(&mut deployment, new_group, ctx, validate_only)
            .await;

        if let Err(e) = result {
            deployment.fail(&e.to_string())?;
            self.persist(&deployment)?;
            match self
                .scheduler
                .cloud()
                .destroy_group(ctx.environment, &new_name)
                .await
            {
                Ok(_) => info!(group = %new_name, "new stack removed"),
                Err(destroy) => {
                    error!(group = %new_name, error = %destroy, "failed to remove new stack");
                    return Err(destroy.into());
                }
            }
            deployment.finish_rollback()?;
            self.persist(&deployment)?;
        }
        Ok(deployment.into_attempt())
    }

    /// The isolated group for a new image: sized like the current
    /// production group (at least one instance), tagged as testing.
    async fn new_stack(
        &self,
        entry: &PipelineEntry,
        image_id: &str,
        ctx: &Context<'_>,
        suffix: &str,
    ) -> RolloutResult<AutoscalingGroup> {
        let env = self.scheduler.environment(ctx.environment)?;
        let pinned = PipelineEntry {
            sequence: 1,
            ami: Some(image_id.to_string()),
            ..entry.clone()
        };
        let mut plans = self
            .scheduler
            .plan(&PipelineSpec::new(vec![pinned]), &env, RunOptions::default())
            .await?;
        let mut group = plans
            .pop()
            .map(|p| p.group)
            .ok_or_else(|| RolloutError::Misconfigured {
                hostclass: entry.hostclass.clone(),
                reason: "nothing to plan".to_string(),
            })?;

        let desired = ctx
            .stable
            .as_ref()
            .map(|g| g.desired_size)
            .unwrap_or(group.desired_size)
            .max(1);
        let (min_size, desired_size, max_size) =
            snap_to_range(group.min_size, desired, group.max_size.max(desired));

        group.name = format!("{}_{suffix}", group_name(ctx.environment, &entry.hostclass));
        group.min_size = min_size;
        group.desired_size = desired_size;
        group.max_size = max_size;
        group.testing = true;
        group.load_balancer = production_registration(ctx).map(|_| LoadBalancerRegistration {
            name: format!("{}-{}-{suffix}", ctx.environment, entry.hostclass),
            mode: LoadBalancerMode::Isolated,
        });
        Ok(group)
    }

    async fn run_blue_green(
        &self,
        deployment: &mut Deployment,
        new_group: AutoscalingGroup,
        ctx: &Context<'_>,
        validate_only: bool,
    ) -> RolloutResult<()> {
        let cloud = self.scheduler.cloud();
        let settings = &ctx.settings;
        let environment = ctx.environment;

        let new_group = launch(
            cloud.as_ref(),
            new_group,
            settings.launch_retries,
            settings.retry_backoff,
        )
        .await?;
        let new_name = new_group.name.as_str();
        self.step(deployment)?;

        self.step(deployment)?;
        self.smoke(deployment, ctx, new_name).await?;

        match &ctx.integration {
            Some(plan) => self.integrate(deployment, ctx, plan, new_name).await?,
            None => {
                deployment.skip_integration()?;
                self.persist(deployment)?;
            }
        }

        if validate_only {
            cloud.destroy_group(environment, new_name).await?;
            if let Some(stable) = &ctx.stable {
                // Future launches use the new image; running instances stay.
                let mut next = stable.clone();
                next.image_id = new_group.image_id.clone();
                cloud.put_group(next).await?;
            }
            deployment.validate()?;
            self.persist(deployment)?;
            return Ok(());
        }

        self.step(deployment)?;
        cloud.exit_test_mode(environment, new_name).await?;

        self.step(deployment)?;
        let registration = production_registration(ctx);
        if let Some(registration) = registration.clone() {
            cloud.attach_load_balancer(environment, new_name, registration).await?;
        }

        self.step(deployment)?;
        if registration.is_some() {
            self.wait_healthy(environment, new_name, settings.health_timeout, settings.smoke_poll)
                .await?;
        }

        if let Some(stable) = &ctx.stable {
            cloud.destroy_group(environment, &stable.name).await?;
        }
        self.step(deployment)?;
        Ok(())
    }

    async fn smoke(&self, deployment: &mut Deployment, ctx: &Context<'_>, group: &str) -> RolloutResult<()> {
        if !ctx.smoke_test {
            deployment.record_smoke(TestOutcome::Skipped);
            return Ok(());
        }
        let gate = self.scheduler.smoke_gate(&ctx.settings);
        match gate.wait_for_group(ctx.environment, group).await {
            Ok(_) => {
                deployment.record_smoke(TestOutcome::Passed);
                Ok(())
            }
            Err(e) => {
                deployment.record_smoke(TestOutcome::Failed {
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// `SmokeWait → IntegrationRunning → IntegrationPassed`, recording the
    /// test outcome on the attempt.
    async fn integrate(
        &self,
        deployment: &mut Deployment,
        ctx: &Context<'_>,
        plan: &IntegrationPlan,
        group: &str,
    ) -> RolloutResult<()> {
        deployment.start_integration()?;
        self.persist(deployment)?;
        let outcome = self
            .run_integration(ctx.environment, plan, group, &ctx.hostclass.name)
            .await;
        if let Err(e) = outcome {
            deployment.record_integration(TestOutcome::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }
        deployment.record_integration(TestOutcome::Passed);
        self.step(deployment)?;
        Ok(())
    }

    /// Run `<test_command> <test>` on a test host. Exit 0 passes; any other
    /// exit code, or failing to run the command at all, fails.
    async fn run_integration(
        &self,
        environment: &str,
        plan: &IntegrationPlan,
        new_group: &str,
        hostclass: &str,
    ) -> RolloutResult<()> {
        let cloud = self.scheduler.cloud();
        let failure = |reason: String| RolloutError::IntegrationTestFailure {
            hostclass: hostclass.to_string(),
            reason,
        };

        let host_group = match &plan.test_hostclass {
            Some(test_hostclass) => production_group(cloud.as_ref(), environment, test_hostclass)
                .await?
                .map(|g| g.name)
                .ok_or_else(|| failure(format!("no {test_hostclass} group to run tests from")))?,
            None => new_group.to_string(),
        };
        let host = cloud
            .list_instances(environment, Some(&host_group))
            .await?
            .into_iter()
            .find(|i| i.status == InstanceStatus::Running)
            .ok_or_else(|| failure(format!("no running test host in {host_group}")))?;

        let mut command = plan.command.clone();
        command.push(plan.test.clone());
        info!(test = %plan.test, host = %host.id, user = %plan.user, "running integration test");

        match self.remote.run(&host, &plan.user, &command).await {
            Ok(0) => {
                info!(test = %plan.test, "integration test passed");
                Ok(())
            }
            Ok(code) => Err(failure(format!("{} exited with {code}", plan.test))),
            Err(e) => Err(failure(format!("could not run {}: {e}", plan.test))),
        }
    }

    async fn wait_healthy(
        &self,
        environment: &str,
        group: &str,
        timeout: Duration,
        poll: Duration,
    ) -> RolloutResult<()> {
        let cloud = self.scheduler.cloud();
        let deadline = Instant::now() + timeout;
        loop {
            if cloud.load_balancer_healthy(environment, group).await? {
                info!(%group, "load balancer healthy");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RolloutError::Unhealthy {
                    group: group.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ── Classic ────────────────────────────────────────────────────

    async fn classic(&self, id: &str, image_id: &str, ctx: &Context<'_>) -> RolloutResult<DeploymentAttempt> {
        let stable = ctx
            .stable
            .as_ref()
            .ok_or_else(|| RolloutError::NoStableGroup(ctx.hostclass.name.clone()))?;
        let mut deployment = Deployment::new(
            id,
            ctx.environment,
            &ctx.hostclass.name,
            DeploymentStrategy::Classic,
            image_id,
            Some(stable.name.clone()),
        );
        self.persist(&deployment)?;

        let result = self
            .run_classic(&mut deployment, image_id, &stable.name, ctx)
            .await;
        if let Err(e) = result {
            deployment.fail(&e.to_string())?;
            self.persist(&deployment)?;
            warn!(group = %stable.name, "classic deployment left a mixed fleet");
        }
        Ok(deployment.into_attempt())
    }

    async fn run_classic(
        &self,
        deployment: &mut Deployment,
        image_id: &str,
        group: &str,
        ctx: &Context<'_>,
    ) -> RolloutResult<()> {
        self.scheduler
            .cloud()
            .set_group_image(ctx.environment, group, image_id)
            .await?;
        self.step(deployment)?;
        self.step(deployment)?;
        self.smoke(deployment, ctx, group).await?;
        if let Some(plan) = &ctx.integration {
            self.integrate(deployment, ctx, plan, group).await?;
        }
        self.step(deployment)?;
        Ok(())
    }

    // ── deploy test / deploy update ────────────────────────────────

    /// Test the newest untested image of one pipeline hostclass, chosen at
    /// random, and promote it to tested or failed.
    pub async fn deploy_test(
        &self,
        environment: &str,
        pipeline: &PipelineSpec,
        filter: &DeployFilter,
    ) -> RolloutResult<DeployOutcome> {
        let state = self.scheduler.state();
        let candidates = match &filter.ami {
            Some(ami) => vec![state.get_image(ami)?.ok_or_else(|| RolloutError::ImageNotFound(ami.clone()))?],
            None => {
                let hostclasses = filtered_hostclasses(pipeline, filter);
                test_candidates(&state.list_images(None)?, &hostclasses)
            }
        };
        let Some(image) = self.pick(&candidates)? else {
            info!(%environment, "no untested images");
            return Ok(DeployOutcome::Nothing);
        };
        if filter.dry_run {
            info!(hostclass = %image.hostclass, image = %image.id, "would test image");
            return Ok(DeployOutcome::Planned {
                hostclass: image.hostclass,
                image_id: image.id,
            });
        }

        let entry = pipeline
            .entry(&image.hostclass)
            .cloned()
            .unwrap_or_else(|| PipelineEntry::new(&image.hostclass));
        let attempt = self
            .deploy(environment, &entry, &image.id, Some(DeploymentStrategy::BlueGreen))
            .await?;
        let stage = if attempt.phase.is_success() {
            ImageStage::Tested
        } else {
            ImageStage::Failed
        };
        state.set_image_stage(&image.id, stage)?;
        info!(image = %image.id, %stage, "image promoted");
        Ok(DeployOutcome::Attempted(attempt))
    }

    /// Roll the newest tested image out to one deployable pipeline
    /// hostclass running something older.
    pub async fn deploy_update(
        &self,
        environment: &str,
        pipeline: &PipelineSpec,
        filter: &DeployFilter,
    ) -> RolloutResult<DeployOutcome> {
        let state = self.scheduler.state();
        let config = self.scheduler.config();
        let cloud = self.scheduler.cloud();

        let mut deployable = Vec::new();
        for hostclass in filtered_hostclasses(pipeline, filter) {
            let settings = config.hostclass(hostclass, Some(environment))?;
            let entry_flag = pipeline.entry(hostclass).and_then(|e| e.deployable);
            if entry_flag.unwrap_or(settings.deployable) {
                deployable.push(hostclass);
            }
        }

        let candidates = match &filter.ami {
            Some(ami) => {
                let image = state.get_image(ami)?.ok_or_else(|| RolloutError::ImageNotFound(ami.clone()))?;
                if !deployable.contains(&image.hostclass.as_str()) {
                    return Err(RolloutError::Misconfigured {
                        hostclass: image.hostclass,
                        reason: "not a deployable hostclass in this pipeline".to_string(),
                    });
                }
                vec![image]
            }
            None => {
                let mut running = HashMap::new();
                for hostclass in &deployable {
                    if let Some(group) = production_group(cloud.as_ref(), environment, hostclass).await? {
                        running.insert(hostclass.to_string(), group.image_id);
                    }
                }
                update_candidates(&state.list_images(None)?, &deployable, &running)
            }
        };

        let Some(image) = self.pick(&candidates)? else {
            info!(%environment, "every deployable hostclass is up to date");
            return Ok(DeployOutcome::Nothing);
        };
        if filter.dry_run {
            info!(hostclass = %image.hostclass, image = %image.id, "would update hostclass");
            return Ok(DeployOutcome::Planned {
                hostclass: image.hostclass,
                image_id: image.id,
            });
        }

        let entry = pipeline
            .entry(&image.hostclass)
            .cloned()
            .unwrap_or_else(|| PipelineEntry::new(&image.hostclass));
        let attempt = self.deploy(environment, &entry, &image.id, None).await?;
        if attempt.phase == DeploymentPhase::RolledBack {
            state.set_image_stage(&image.id, ImageStage::Failed)?;
        }
        Ok(DeployOutcome::Attempted(attempt))
    }

    fn pick(&self, candidates: &[asiaq_state::Image]) -> RolloutResult<Option<asiaq_state::Image>> {
        let mut rng = self.rng.lock().map_err(|_| RolloutError::RandomSourcePoisoned)?;
        Ok(pick(candidates, rng.as_mut()))
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Compensate attempts left unfinished by an interrupted process:
    /// blue/green attempts lose their new group and end `RolledBack`,
    /// classic ones end `MixedFleet`.
    pub async fn recover(&self, environment: &str) -> RolloutResult<Vec<DeploymentAttempt>> {
        let mut recovered = Vec::new();
        for attempt in self.scheduler.state().list_attempts(environment)? {
            if attempt.phase.is_terminal() {
                continue;
            }
            let mut deployment = Deployment::from_attempt(attempt);
            if deployment.phase() != DeploymentPhase::Rollback {
                deployment.fail("interrupted")?;
                self.persist(&deployment)?;
            }
            if deployment.phase() == DeploymentPhase::Rollback {
                if let Some(group) = deployment.attempt().new_group.clone() {
                    self.scheduler.cloud().destroy_group(environment, &group).await?;
                }
                deployment.finish_rollback()?;
                self.persist(&deployment)?;
            }
            warn!(attempt = %deployment.attempt().id, phase = %deployment.phase(), "recovered interrupted deployment");
            recovered.push(deployment.into_attempt());
        }
        Ok(recovered)
    }
}

/// The production load-balancer registration for the hostclass, if it has one.
fn production_registration(ctx: &Context<'_>) -> Option<LoadBalancerRegistration> {
    ctx.stable
        .as_ref()
        .and_then(|g| g.load_balancer.clone())
        .filter(|lb| lb.mode == LoadBalancerMode::Production)
        .or_else(|| {
            ctx.hostclass.elb.then(|| LoadBalancerRegistration {
                name: format!("{}-{}", ctx.environment, ctx.hostclass.name),
                mode: LoadBalancerMode::Production,
            })
        })
}

fn filtered_hostclasses<'a>(pipeline: &'a PipelineSpec, filter: &DeployFilter) -> Vec<&'a str> {
    pipeline
        .hostclasses()
        .into_iter()
        .filter(|h| filter.hostclass.as_deref().is_none_or(|only| only == *h))
        .collect()
}
