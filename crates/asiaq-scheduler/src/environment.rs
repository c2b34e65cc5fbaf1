//! Environment lifecycle: create, update, destroy, list.

use std::sync::Arc;

use tracing::{info, warn};

use asiaq_config::AsiaqConfig;
use asiaq_core::{RandomSource, epoch_secs};
use asiaq_network::{Cidr, allocate, plan_metanetworks};
use asiaq_state::{Environment, EnvironmentRegistry, StateResult};

use crate::cloud::Cloud;
use crate::error::{SchedulerError, SchedulerResult};

pub struct EnvironmentManager {
    registry: EnvironmentRegistry,
    cloud: Arc<dyn Cloud>,
    config: AsiaqConfig,
}

impl EnvironmentManager {
    pub fn new(registry: EnvironmentRegistry, cloud: Arc<dyn Cloud>, config: AsiaqConfig) -> Self {
        Self {
            registry,
            cloud,
            config,
        }
    }

    pub fn list(&self) -> StateResult<Vec<Environment>> {
        self.registry.list()
    }

    /// Allocate a range and metanetworks for `name` and register it.
    ///
    /// Allocation and registration happen in one registry transaction, so
    /// concurrent creates never receive overlapping ranges. With `dry_run`
    /// the plan is computed against the live registry and returned without
    /// being recorded.
    pub fn create(
        &self,
        name: &str,
        env_type: Option<&str>,
        rng: &mut dyn RandomSource,
        dry_run: bool,
    ) -> SchedulerResult<Environment> {
        let network = self.config.network(name, env_type)?;
        let parent = network.parent_space();

        let mut compute = |existing: &[Environment]| -> SchedulerResult<Environment> {
            if existing.iter().any(|e| e.name == name) {
                return Err(SchedulerError::EnvironmentExists(name.to_string()));
            }
            let range = match (network.vpc_cidr, network.vpc_cidr_size) {
                (Some(range), _) => range,
                (None, Some(prefix_len)) => {
                    let taken: Vec<Cidr> = existing
                        .iter()
                        .filter(|e| e.parent_space.overlaps(&parent))
                        .map(|e| e.range)
                        .collect();
                    allocate(&parent, prefix_len, &taken, rng)?
                }
                (None, None) => {
                    return Err(SchedulerError::Config(asiaq_config::ConfigError::MissingKey {
                        scope: format!("environment {name}"),
                        key: "vpc_cidr_size".to_string(),
                    }));
                }
            };
            let metanetworks = plan_metanetworks(&range, &network.topology, rng)?;
            let now = epoch_secs();
            Ok(Environment {
                id: format!("env-{:08x}", rng.below(1 << 32)),
                name: name.to_string(),
                env_type: network.env_type.clone(),
                parent_space: parent,
                range,
                metanetworks,
                created_at: now,
                updated_at: now,
            })
        };

        if dry_run {
            let env = compute(&self.registry.list()?)?;
            info!(environment = %name, range = %env.range, "environment planned (dry run)");
            return Ok(env);
        }

        let env = self.registry.register_with(compute)?;
        info!(
            environment = %name,
            range = %env.range,
            metanetworks = env.metanetworks.len(),
            "environment created"
        );
        Ok(env)
    }

    /// Re-apply rules and routes from configuration, keeping every existing
    /// metanetwork range. Metanetworks newly named in configuration are
    /// allocated out of the free part of the environment range.
    pub fn update(&self, name: &str, rng: &mut dyn RandomSource, dry_run: bool) -> SchedulerResult<Environment> {
        let current = self
            .registry
            .get(name)?
            .ok_or_else(|| SchedulerError::EnvironmentNotFound(name.to_string()))?;
        let network = self.config.network(name, Some(&current.env_type))?;
        let topology = network.pinned_to(&current.metanetworks);

        let updated = Environment {
            metanetworks: plan_metanetworks(&current.range, &topology, rng)?,
            updated_at: epoch_secs(),
            ..current
        };
        if dry_run {
            return Ok(updated);
        }
        let updated = self.registry.update(updated)?;
        info!(environment = %name, "environment updated");
        Ok(updated)
    }

    /// Destroy every group in the environment, then release its range.
    ///
    /// Returns the number of groups destroyed.
    pub async fn destroy(&self, name: &str, dry_run: bool) -> SchedulerResult<usize> {
        if self.registry.get(name)?.is_none() {
            return Err(SchedulerError::EnvironmentNotFound(name.to_string()));
        }
        let groups = self.cloud.list_groups(name).await?;
        if dry_run {
            info!(environment = %name, groups = groups.len(), "would destroy environment");
            return Ok(groups.len());
        }

        for group in &groups {
            if !self.cloud.destroy_group(name, &group.name).await? {
                warn!(environment = %name, group = %group.name, "group vanished during destroy");
            }
        }
        self.registry.unregister(name)?;
        info!(environment = %name, groups = groups.len(), "environment destroyed");
        Ok(groups.len())
    }
}
