//! Store-backed cloud: groups and instances live in the state store.
//!
//! Instances boot instantly into `Running` (or whatever boot status has
//! been configured for their hostclass) and get private addresses from
//! their group's subnets. Launch failures and boot statuses can be
//! injected per hostclass to exercise the failure paths.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use asiaq_core::{RandomSource, StdRandom, epoch_secs};
use asiaq_state::{
    AutoscalingGroup, Instance, InstanceId, InstanceStatus, LoadBalancerRegistration, Snapshot,
    StateStore,
};

use crate::cloud::{Cloud, CloudError, CloudResult, SmokeProbe, SmokeStatus};

/// Addresses at the start of every subnet held back for the provider.
const RESERVED_HEAD: u32 = 4;

#[derive(Default)]
struct Faults {
    launch_failures: HashMap<String, u32>,
    boot_status: HashMap<String, InstanceStatus>,
}

pub struct LocalCloud {
    state: StateStore,
    rng: Mutex<StdRandom>,
    faults: Mutex<Faults>,
}

impl LocalCloud {
    pub fn new(state: StateStore) -> Self {
        Self::with_rng(state, StdRandom::from_os())
    }

    pub fn with_rng(state: StateStore, rng: StdRandom) -> Self {
        Self {
            state,
            rng: Mutex::new(rng),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Make the next `times` launches of `hostclass` fail.
    pub fn fail_launches(&self, hostclass: &str, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.launch_failures.insert(hostclass.to_string(), times);
        }
    }

    /// Boot new instances of `hostclass` into `status` instead of `Running`.
    pub fn boot_into(&self, hostclass: &str, status: InstanceStatus) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.boot_status.insert(hostclass.to_string(), status);
        }
    }

    /// Overwrite the recorded status of one instance.
    pub fn set_instance_status(&self, instance: &Instance, status: InstanceStatus) -> CloudResult<()> {
        let mut updated = instance.clone();
        updated.status = status;
        self.state.put_instance(&updated)?;
        Ok(())
    }

    fn take_launch_failure(&self, hostclass: &str) -> bool {
        let Ok(mut faults) = self.faults.lock() else {
            return false;
        };
        match faults.launch_failures.get_mut(hostclass) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn boot_status(&self, hostclass: &str) -> InstanceStatus {
        self.faults
            .lock()
            .ok()
            .and_then(|f| f.boot_status.get(hostclass).copied())
            .unwrap_or(InstanceStatus::Running)
    }

    fn instance_id(&self) -> InstanceId {
        let draw = match self.rng.lock() {
            Ok(mut rng) => rng.below(u64::MAX),
            Err(_) => epoch_secs(),
        };
        format!("i-{draw:016x}")
    }

    fn live_instances(&self, environment: &str, group: &str) -> CloudResult<Vec<Instance>> {
        Ok(self
            .state
            .list_instances_for_group(environment, group)?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect())
    }

    /// Bring the group's live instance count to its desired size.
    fn reconcile(&self, group: &AutoscalingGroup) -> CloudResult<()> {
        let mut live = self.live_instances(&group.environment, &group.name)?;
        let desired = group.desired_size as usize;

        if live.len() > desired {
            live.sort_by_key(|i| i.launched_at);
            for instance in live.split_off(desired) {
                self.state.delete_instance(&instance)?;
                debug!(group = %group.name, instance = %instance.id, "instance scaled in");
            }
            return Ok(());
        }

        let mut used: HashSet<Ipv4Addr> = self
            .state
            .list_instances(&group.environment)?
            .iter()
            .filter_map(|i| i.private_ip)
            .collect();
        let status = self.boot_status(&group.hostclass);
        let now = epoch_secs();

        for n in live.len()..desired {
            let private_ip = match group.ip_address {
                Some(ip) if !used.contains(&ip) => Some(ip),
                _ => next_address(group, n, &used)?,
            };
            if let Some(ip) = private_ip {
                used.insert(ip);
            }
            let instance = Instance {
                id: self.instance_id(),
                environment: group.environment.clone(),
                group: group.name.clone(),
                hostclass: group.hostclass.clone(),
                image_id: group.image_id.clone(),
                private_ip,
                status,
                launched_at: now,
            };
            self.state.put_instance(&instance)?;
            debug!(group = %group.name, instance = %instance.id, ip = ?private_ip, "instance launched");
        }
        Ok(())
    }

    fn require_group(&self, environment: &str, name: &str) -> CloudResult<AutoscalingGroup> {
        self.state
            .get_group(environment, name)?
            .ok_or_else(|| CloudError::GroupNotFound {
                environment: environment.to_string(),
                group: name.to_string(),
            })
    }
}

/// First free address in the subnet the `n`th instance lands in.
fn next_address(
    group: &AutoscalingGroup,
    n: usize,
    used: &HashSet<Ipv4Addr>,
) -> CloudResult<Option<Ipv4Addr>> {
    if group.subnets.is_empty() {
        return Ok(None);
    }
    // Spread across zones, falling through to the next zone when one is full.
    for offset in 0..group.subnets.len() {
        let subnet = &group.subnets[(n + offset) % group.subnets.len()];
        let start = subnet.first().saturating_add(RESERVED_HEAD);
        let end = subnet.last().saturating_sub(1);
        if let Some(ip) = (start..=end).map(Ipv4Addr::from).find(|ip| !used.contains(ip)) {
            return Ok(Some(ip));
        }
    }
    Err(CloudError::AddressExhausted(group.name.clone()))
}

#[async_trait]
impl Cloud for LocalCloud {
    async fn put_group(&self, mut group: AutoscalingGroup) -> CloudResult<AutoscalingGroup> {
        if self.take_launch_failure(&group.hostclass) {
            warn!(group = %group.name, "injected launch failure");
            return Err(CloudError::LaunchFailed {
                group: group.name,
                reason: "injected failure".to_string(),
            });
        }

        let now = epoch_secs();
        let existing = self.state.get_group(&group.environment, &group.name)?;
        group.created_at = existing.as_ref().map(|g| g.created_at).unwrap_or(now);
        group.updated_at = now;
        self.state.put_group(&group)?;
        self.reconcile(&group)?;

        info!(
            group = %group.name,
            image = %group.image_id,
            desired = group.desired_size,
            created = existing.is_none(),
            "group applied"
        );
        Ok(group)
    }

    async fn find_group(&self, environment: &str, name: &str) -> CloudResult<Option<AutoscalingGroup>> {
        Ok(self.state.get_group(environment, name)?)
    }

    async fn list_groups(&self, environment: &str) -> CloudResult<Vec<AutoscalingGroup>> {
        Ok(self.state.list_groups(environment)?)
    }

    async fn set_group_image(
        &self,
        environment: &str,
        name: &str,
        image_id: &str,
    ) -> CloudResult<AutoscalingGroup> {
        let mut group = self.require_group(environment, name)?;
        group.image_id = image_id.to_string();
        group.updated_at = epoch_secs();
        self.state.put_group(&group)?;

        let replaced = self.state.delete_instances_for_group(environment, name)?;
        self.reconcile(&group)?;
        info!(group = %name, image = %image_id, replaced, "group image updated");
        Ok(group)
    }

    async fn destroy_group(&self, environment: &str, name: &str) -> CloudResult<bool> {
        let terminated = self.state.delete_instances_for_group(environment, name)?;
        let existed = self.state.delete_group(environment, name)?;
        if existed {
            info!(group = %name, terminated, "group destroyed");
        }
        Ok(existed)
    }

    async fn list_instances(&self, environment: &str, group: Option<&str>) -> CloudResult<Vec<Instance>> {
        let instances = match group {
            Some(group) => self.state.list_instances_for_group(environment, group)?,
            None => self.state.list_instances(environment)?,
        };
        Ok(instances)
    }

    async fn terminate_instances(&self, environment: &str, ids: &[InstanceId]) -> CloudResult<u32> {
        let mut terminated = 0;
        for instance in self.state.list_instances(environment)? {
            if ids.contains(&instance.id) && self.state.delete_instance(&instance)? {
                terminated += 1;
            }
        }
        info!(%environment, terminated, "instances terminated");
        Ok(terminated)
    }

    async fn latest_snapshot(&self, hostclass: &str) -> CloudResult<Option<Snapshot>> {
        Ok(self.state.latest_snapshot(hostclass)?)
    }

    async fn attach_load_balancer(
        &self,
        environment: &str,
        group: &str,
        registration: LoadBalancerRegistration,
    ) -> CloudResult<()> {
        let mut record = self.require_group(environment, group)?;
        debug!(%group, lb = %registration.name, mode = ?registration.mode, "load balancer attached");
        record.load_balancer = Some(registration);
        record.updated_at = epoch_secs();
        self.state.put_group(&record)?;
        Ok(())
    }

    async fn load_balancer_healthy(&self, environment: &str, group: &str) -> CloudResult<bool> {
        let record = self.require_group(environment, group)?;
        if record.load_balancer.is_none() {
            return Ok(false);
        }
        let instances = self.state.list_instances_for_group(environment, group)?;
        Ok(instances.len() >= record.desired_size as usize
            && instances.iter().all(|i| i.status == InstanceStatus::Running))
    }

    async fn exit_test_mode(&self, environment: &str, group: &str) -> CloudResult<()> {
        let mut record = self.require_group(environment, group)?;
        record.testing = false;
        record.updated_at = epoch_secs();
        self.state.put_group(&record)?;
        debug!(%group, "group left test mode");
        Ok(())
    }
}

/// Smoke probe that trusts the recorded instance status.
pub struct StatusProbe {
    state: StateStore,
}

impl StatusProbe {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl SmokeProbe for StatusProbe {
    async fn probe(&self, instance: &Instance) -> SmokeStatus {
        let current = match self
            .state
            .list_instances_for_group(&instance.environment, &instance.group)
        {
            Ok(instances) => instances.into_iter().find(|i| i.id == instance.id),
            Err(e) => return SmokeStatus::Failed(e.to_string()),
        };
        match current.map(|i| i.status) {
            Some(InstanceStatus::Running) => SmokeStatus::Passed,
            Some(InstanceStatus::Pending) => SmokeStatus::Pending,
            Some(status) => SmokeStatus::Failed(format!("instance is {status:?}")),
            None => SmokeStatus::Failed("instance no longer exists".to_string()),
        }
    }
}
