//! ProvisioningScheduler: ordered, smoke-gated pipeline startup.
//!
//! A pipeline run is planned completely before anything is launched, so
//! configuration and catalog problems surface with nothing to clean up.
//! Sequence groups then run strictly one after another; entries inside a
//! group launch concurrently, bounded by `max_parallel`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use asiaq_autoscale::{CapacityPlanner, scheduled_actions};
use asiaq_config::{AsiaqConfig, PipelineEntry, PipelineSpec, Settings};
use asiaq_state::{
    AutoscalingGroup, Environment, LoadBalancerMode, LoadBalancerRegistration, StateStore,
    TestOutcome, group_name,
};

use crate::cloud::{Cloud, SmokeProbe};
use crate::error::{SchedulerError, SchedulerResult};
use crate::smoke::SmokeGate;

/// Run-level switches.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// `false` skips smoke gating for every entry.
    pub smoke_test: bool,
    /// Keep groups created by a failed run for investigation.
    pub no_destroy: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            smoke_test: true,
            no_destroy: false,
        }
    }
}

/// Everything needed to launch one pipeline entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub sequence: u32,
    pub group: AutoscalingGroup,
    pub smoke_test: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub sequence: u32,
    pub hostclass: String,
    pub group: String,
    pub image_id: String,
    pub desired_size: u32,
    pub created: bool,
    pub smoke: TestOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionReport {
    pub environment: String,
    pub launches: Vec<LaunchReport>,
}

/// Result of one entry's task. `created` is known before the first launch
/// attempt so partially created groups are still torn down.
struct EntryOutcome {
    index: usize,
    group: String,
    created: bool,
    result: SchedulerResult<LaunchReport>,
}

pub struct ProvisioningScheduler {
    cloud: Arc<dyn Cloud>,
    probe: Arc<dyn SmokeProbe>,
    state: StateStore,
    config: AsiaqConfig,
    planner: CapacityPlanner,
    clock: fn() -> DateTime<Utc>,
}

impl ProvisioningScheduler {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        probe: Arc<dyn SmokeProbe>,
        state: StateStore,
        config: AsiaqConfig,
    ) -> Self {
        Self {
            cloud,
            probe,
            state,
            config,
            planner: CapacityPlanner::new(),
            clock: Utc::now,
        }
    }

    /// Evaluate capacity schedules against `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cloud(&self) -> &Arc<dyn Cloud> {
        &self.cloud
    }

    pub fn probe(&self) -> &Arc<dyn SmokeProbe> {
        &self.probe
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn config(&self) -> &AsiaqConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn environment(&self, name: &str) -> SchedulerResult<Environment> {
        self.state
            .get_environment(name)?
            .ok_or_else(|| SchedulerError::EnvironmentNotFound(name.to_string()))
    }

    pub fn smoke_gate(&self, settings: &Settings) -> SmokeGate {
        SmokeGate::new(
            Arc::clone(&self.cloud),
            Arc::clone(&self.probe),
            settings.smoke_timeout,
            settings.smoke_poll,
        )
    }

    /// Plan every entry of the pipeline without touching the cloud's state.
    pub async fn plan(
        &self,
        pipeline: &PipelineSpec,
        environment: &Environment,
        options: RunOptions,
    ) -> SchedulerResult<Vec<LaunchPlan>> {
        let settings = self.config.settings(Some(&environment.name))?;
        let mut plans = Vec::with_capacity(pipeline.entries().len());
        for entry in pipeline.entries() {
            plans.push(self.plan_entry(entry, environment, &settings, options).await?);
        }
        Ok(plans)
    }

    async fn plan_entry(
        &self,
        entry: &PipelineEntry,
        environment: &Environment,
        settings: &Settings,
        options: RunOptions,
    ) -> SchedulerResult<LaunchPlan> {
        let hostclass = self.config.hostclass(&entry.hostclass, Some(&environment.name))?;
        let meta = environment.metanetwork(hostclass.meta_network).ok_or_else(|| {
            SchedulerError::Placement {
                hostclass: entry.hostclass.clone(),
                reason: format!(
                    "environment {} has no {} metanetwork",
                    environment.name, hostclass.meta_network
                ),
            }
        })?;
        let ip_address = hostclass
            .ip_address
            .as_deref()
            .map(|spec| meta.range.resolve_address(spec))
            .transpose()?;

        let image_id = match &entry.ami {
            Some(ami) => ami.clone(),
            None => self
                .state
                .list_images(Some(&entry.hostclass))?
                .into_iter()
                .rev()
                .find(|i| i.stage == settings.ami_stage)
                .map(|i| i.id)
                .ok_or_else(|| SchedulerError::NoImage {
                    hostclass: entry.hostclass.clone(),
                    stage: settings.ami_stage.to_string(),
                })?,
        };

        let existing = production_group(self.cloud.as_ref(), &environment.name, &entry.hostclass).await?;
        let (min_size, desired_size, max_size) =
            resolve_sizes(&self.planner, entry, existing.as_ref(), self.now());

        let group = AutoscalingGroup {
            name: existing
                .as_ref()
                .map(|g| g.name.clone())
                .unwrap_or_else(|| group_name(&environment.name, &entry.hostclass)),
            environment: environment.name.clone(),
            hostclass: entry.hostclass.clone(),
            image_id,
            min_size,
            desired_size,
            max_size,
            schedule: scheduled_actions(
                entry.min_size.as_ref(),
                entry.desired_size.as_ref(),
                entry.max_size.as_ref(),
            ),
            instance_type: entry
                .instance_type
                .clone()
                .unwrap_or_else(|| hostclass.instance_type.clone()),
            snapshot_id: None,
            extra_disk: entry.extra_disk,
            iops: entry.iops,
            subnets: meta.subnet_ranges(),
            ip_address,
            public_ip: hostclass.public_ip,
            load_balancer: existing.as_ref().and_then(|g| g.load_balancer.clone()).or_else(|| {
                hostclass.elb.then(|| LoadBalancerRegistration {
                    name: format!("{}-{}", environment.name, entry.hostclass),
                    mode: LoadBalancerMode::Production,
                })
            }),
            chaos: hostclass.chaos,
            testing: false,
            created_at: 0,
            updated_at: 0,
        };
        debug!(
            hostclass = %entry.hostclass,
            group = %group.name,
            image = %group.image_id,
            min = min_size,
            desired = desired_size,
            max = max_size,
            "entry planned"
        );

        Ok(LaunchPlan {
            sequence: entry.sequence,
            group,
            smoke_test: options.smoke_test && entry.smoke_test.unwrap_or(hostclass.smoke_test),
        })
    }

    /// Provision every entry of the pipeline, sequence group by sequence group.
    pub async fn run(
        &self,
        pipeline: &PipelineSpec,
        environment: &str,
        options: RunOptions,
    ) -> SchedulerResult<ProvisionReport> {
        let env = self.environment(environment)?;
        let settings = self.config.settings(Some(environment))?;
        let plans = self.plan(pipeline, &env, options).await?;

        let gate = self.smoke_gate(&settings);
        let semaphore = Arc::new(Semaphore::new(settings.max_parallel));
        let mut report = ProvisionReport {
            environment: environment.to_string(),
            launches: Vec::new(),
        };
        let mut created_this_run: Vec<String> = Vec::new();

        for (sequence, entries) in pipeline.groups() {
            let batch: Vec<LaunchPlan> = plans
                .iter()
                .filter(|p| p.sequence == sequence)
                .cloned()
                .collect();
            info!(
                %environment,
                sequence,
                hostclasses = ?entries.iter().map(|e| e.hostclass.as_str()).collect::<Vec<_>>(),
                "starting sequence group"
            );

            let mut tasks = JoinSet::new();
            for (index, plan) in batch.iter().cloned().enumerate() {
                tasks.spawn(run_entry(
                    index,
                    plan,
                    Arc::clone(&self.cloud),
                    gate.clone(),
                    Arc::clone(&semaphore),
                    settings.launch_retries,
                    settings.retry_backoff,
                ));
            }

            // Siblings always run to completion; failures are judged afterwards.
            let mut outcomes = Vec::with_capacity(batch.len());
            let mut aborted = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => aborted = Some(e.to_string()),
                }
            }
            outcomes.sort_by_key(|o| o.index);

            let mut failure = aborted.map(|reason| SchedulerError::ProvisionFailure {
                sequence,
                hostclass: "?".to_string(),
                reason: format!("launch task aborted: {reason}"),
            });
            for outcome in outcomes {
                if outcome.created {
                    created_this_run.push(outcome.group.clone());
                }
                match outcome.result {
                    Ok(launch) => report.launches.push(launch),
                    Err(e) => {
                        let hostclass = batch[outcome.index].group.hostclass.clone();
                        error!(%environment, sequence, %hostclass, error = %e, "entry failed");
                        if failure.is_none() {
                            failure = Some(SchedulerError::ProvisionFailure {
                                sequence,
                                hostclass,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }

            if let Some(failure) = failure {
                if options.no_destroy {
                    warn!(%environment, groups = created_this_run.len(), "keeping groups of failed run");
                } else {
                    self.tear_down(environment, &created_this_run).await;
                }
                return Err(failure);
            }
            info!(%environment, sequence, "sequence group ready");
        }

        info!(%environment, launches = report.launches.len(), "pipeline provisioned");
        Ok(report)
    }

    /// Provision a single hostclass, as a one-entry pipeline.
    pub async fn provision(
        &self,
        entry: PipelineEntry,
        environment: &str,
        options: RunOptions,
    ) -> SchedulerResult<LaunchReport> {
        let hostclass = entry.hostclass.clone();
        let pipeline = PipelineSpec::new(vec![PipelineEntry { sequence: 1, ..entry }]);
        self.run(&pipeline, environment, options)
            .await?
            .launches
            .pop()
            .ok_or_else(|| SchedulerError::ProvisionFailure {
                sequence: 1,
                hostclass,
                reason: "nothing launched".to_string(),
            })
    }

    /// Destroy every group of every hostclass in the pipeline, last sequence
    /// first. Returns the destroyed group names.
    pub async fn spindown(&self, pipeline: &PipelineSpec, environment: &str) -> SchedulerResult<Vec<String>> {
        self.environment(environment)?;
        let groups = self.cloud.list_groups(environment).await?;
        let mut destroyed = Vec::new();
        for (_, entries) in pipeline.groups().into_iter().rev() {
            for entry in entries {
                for group in groups.iter().filter(|g| g.hostclass == entry.hostclass) {
                    if self.cloud.destroy_group(environment, &group.name).await? {
                        destroyed.push(group.name.clone());
                    }
                }
            }
        }
        info!(%environment, groups = destroyed.len(), "pipeline spun down");
        Ok(destroyed)
    }

    async fn tear_down(&self, environment: &str, groups: &[String]) {
        for group in groups.iter().rev() {
            match self.cloud.destroy_group(environment, group).await {
                Ok(_) => info!(%environment, %group, "group torn down"),
                Err(e) => error!(%environment, %group, error = %e, "failed to tear down group"),
            }
        }
    }
}

async fn run_entry(
    index: usize,
    plan: LaunchPlan,
    cloud: Arc<dyn Cloud>,
    gate: SmokeGate,
    semaphore: Arc<Semaphore>,
    retries: u32,
    backoff: Duration,
) -> EntryOutcome {
    let name = plan.group.name.clone();
    let environment = plan.group.environment.clone();
    let created = match cloud.find_group(&environment, &name).await {
        Ok(existing) => existing.is_none(),
        Err(e) => {
            return EntryOutcome {
                index,
                group: name,
                created: false,
                result: Err(e.into()),
            };
        }
    };

    let result = launch_and_smoke(&plan, cloud.as_ref(), &gate, &semaphore, retries, backoff, created).await;

    EntryOutcome {
        index,
        group: name,
        created,
        result,
    }
}

async fn launch_and_smoke(
    plan: &LaunchPlan,
    cloud: &dyn Cloud,
    gate: &SmokeGate,
    semaphore: &Semaphore,
    retries: u32,
    backoff: Duration,
    created: bool,
) -> SchedulerResult<LaunchReport> {
    let group = {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| SchedulerError::ProvisionFailure {
                sequence: plan.sequence,
                hostclass: plan.group.hostclass.clone(),
                reason: e.to_string(),
            })?;
        launch(cloud, plan.group.clone(), retries, backoff).await?
    };

    let smoke = if plan.smoke_test {
        gate.wait_for_group(&group.environment, &group.name).await?;
        TestOutcome::Passed
    } else {
        debug!(hostclass = %group.hostclass, "smoke test skipped");
        TestOutcome::Skipped
    };

    Ok(LaunchReport {
        sequence: plan.sequence,
        hostclass: group.hostclass,
        group: group.name,
        image_id: group.image_id,
        desired_size: group.desired_size,
        created,
        smoke,
    })
}

/// Apply the group, retrying with exponential backoff.
pub async fn launch(
    cloud: &dyn Cloud,
    mut group: AutoscalingGroup,
    retries: u32,
    backoff: Duration,
) -> SchedulerResult<AutoscalingGroup> {
    group.snapshot_id = cloud.latest_snapshot(&group.hostclass).await?.map(|s| s.id);

    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match cloud.put_group(group.clone()).await {
            Ok(applied) => return Ok(applied),
            Err(e) if attempt < retries => {
                warn!(group = %group.name, attempt, error = %e, "launch failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                return Err(SchedulerError::Placement {
                    hostclass: group.hostclass.clone(),
                    reason: format!("launch failed after {attempt} attempts: {e}"),
                });
            }
        }
    }
}

/// The non-testing group currently serving `hostclass`, if any.
pub async fn production_group(
    cloud: &dyn Cloud,
    environment: &str,
    hostclass: &str,
) -> SchedulerResult<Option<AutoscalingGroup>> {
    let canonical = group_name(environment, hostclass);
    let mut candidates: Vec<AutoscalingGroup> = cloud
        .list_groups(environment)
        .await?
        .into_iter()
        .filter(|g| g.hostclass == hostclass && !g.testing)
        .collect();
    if let Some(pos) = candidates.iter().position(|g| g.name == canonical) {
        return Ok(Some(candidates.swap_remove(pos)));
    }
    candidates.sort_by_key(|g| g.updated_at);
    Ok(candidates.pop())
}

/// Min, desired and max for an entry.
///
/// Unset sizes keep the live group's values; a new group defaults to
/// `min = 0`, `max = max(min, max, desired)`, `desired = max`. The result
/// is snapped so that `min <= desired <= max`.
pub fn resolve_sizes(
    planner: &CapacityPlanner,
    entry: &PipelineEntry,
    existing: Option<&AutoscalingGroup>,
    now: DateTime<Utc>,
) -> (u32, u32, u32) {
    let min = entry.min_size.as_ref().map(|s| s.min_count());
    let max = entry.max_size.as_ref().map(|s| s.max_count());
    let desired = entry.desired_size.as_ref().map(|s| planner.resolve(s, now));

    let (min, desired, max) = match existing {
        Some(g) => {
            let min = min.unwrap_or(g.min_size);
            let desired = desired.unwrap_or(g.desired_size);
            let max = max.unwrap_or_else(|| g.max_size.max(desired));
            (min, desired, max)
        }
        None => {
            let min = min.unwrap_or(0);
            let max = min.max(max.unwrap_or(0)).max(desired.unwrap_or(0));
            (min, desired.unwrap_or(max), max)
        }
    };
    snap_to_range(min, desired, max)
}

/// Clamp `desired` into `[min, max]`, raising `max` to `min` if needed.
pub fn snap_to_range(min: u32, desired: u32, max: u32) -> (u32, u32, u32) {
    let max = max.max(min);
    (min, desired.clamp(min, max), max)
}
