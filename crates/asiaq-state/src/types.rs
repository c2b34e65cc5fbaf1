//! Domain types for the Asiaq state store.
//!
//! These types represent the persisted state of environments, autoscaling
//! groups, instances, deployment attempts, snapshots and images. All types
//! are serializable to/from JSON for storage in redb tables.

use std::fmt;
use std::net::Ipv4Addr;

use asiaq_autoscale::ScheduledAction;
use asiaq_core::{DeploymentStrategy, ImageStage, MetanetworkName};
use asiaq_network::{Cidr, Metanetwork};
use serde::{Deserialize, Serialize};

/// Unique identifier for a cloud instance.
pub type InstanceId = String;

/// Unique identifier for a deployment attempt.
pub type AttemptId = String;

/// Production group name for a hostclass in an environment.
pub fn group_name(environment: &str, hostclass: &str) -> String {
    format!("{environment}_{hostclass}")
}

// ── Environment ────────────────────────────────────────────────────

/// A network-isolated environment and its address plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub env_type: String,
    /// Address space the range was drawn from.
    pub parent_space: Cidr,
    pub range: Cidr,
    pub metanetworks: Vec<Metanetwork>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Environment {
    pub fn metanetwork(&self, name: MetanetworkName) -> Option<&Metanetwork> {
        self.metanetworks.iter().find(|m| m.name == name)
    }
}

// ── Autoscaling groups ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerMode {
    /// Reachable only for testing; serves no production traffic.
    Isolated,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerRegistration {
    pub name: String,
    pub mode: LoadBalancerMode,
}

/// One hostclass's fleet in one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoscalingGroup {
    pub name: String,
    pub environment: String,
    pub hostclass: String,
    pub image_id: String,
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
    /// Recurring size changes registered on the group.
    pub schedule: Vec<ScheduledAction>,
    pub instance_type: String,
    pub snapshot_id: Option<String>,
    pub extra_disk: Option<u32>,
    pub iops: Option<u32>,
    pub subnets: Vec<Cidr>,
    pub ip_address: Option<Ipv4Addr>,
    pub public_ip: bool,
    pub load_balancer: Option<LoadBalancerRegistration>,
    /// Eligible for chaos termination.
    pub chaos: bool,
    /// Stood up for testing; not serving production.
    pub testing: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AutoscalingGroup {
    /// Composite key for the redb table: `{environment}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.environment, self.name)
    }
}

// ── Instances ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Terminated,
    Failed,
}

impl InstanceStatus {
    /// The instance will never become reachable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub environment: String,
    pub group: String,
    pub hostclass: String,
    pub image_id: String,
    pub private_ip: Option<Ipv4Addr>,
    pub status: InstanceStatus,
    pub launched_at: u64,
}

impl Instance {
    /// Composite key for the redb table: `{environment}/{group}:{id}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}:{}", self.environment, self.group, self.id)
    }
}

// ── Snapshots and images ───────────────────────────────────────────

/// A volume snapshot attached to new instances of a hostclass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub hostclass: String,
    pub size_gb: u32,
    pub created_at: u64,
}

impl Snapshot {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.hostclass, self.id)
    }
}

/// A baked machine image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub hostclass: String,
    pub stage: ImageStage,
    pub created_at: u64,
}

// ── Deployment attempts ────────────────────────────────────────────

/// Where a deployment attempt stands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Pending,
    NewStackCreated,
    SmokeWait,
    IntegrationRunning,
    IntegrationPassed,
    ExitTestMode,
    AttachToProduction,
    WaitHealthy,
    OldStackDestroyed,
    Rollback,
    RolledBack,
    /// Classic: image swapped on the existing group.
    ImageUpdated,
    Completed,
    /// Classic failure: old and new images both serving.
    MixedFleet,
    /// Image validated on an isolated group; production untouched.
    Validated,
}

impl DeploymentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentPhase::OldStackDestroyed
                | DeploymentPhase::RolledBack
                | DeploymentPhase::Completed
                | DeploymentPhase::MixedFleet
                | DeploymentPhase::Validated
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeploymentPhase::OldStackDestroyed | DeploymentPhase::Completed | DeploymentPhase::Validated
        )
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentPhase::Pending => "pending",
            DeploymentPhase::NewStackCreated => "new_stack_created",
            DeploymentPhase::SmokeWait => "smoke_wait",
            DeploymentPhase::IntegrationRunning => "integration_running",
            DeploymentPhase::IntegrationPassed => "integration_passed",
            DeploymentPhase::ExitTestMode => "exit_test_mode",
            DeploymentPhase::AttachToProduction => "attach_to_production",
            DeploymentPhase::WaitHealthy => "wait_healthy",
            DeploymentPhase::OldStackDestroyed => "old_stack_destroyed",
            DeploymentPhase::Rollback => "rollback",
            DeploymentPhase::RolledBack => "rolled_back",
            DeploymentPhase::ImageUpdated => "image_updated",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::MixedFleet => "mixed_fleet",
            DeploymentPhase::Validated => "validated",
        };
        f.write_str(s)
    }
}

/// Result of a smoke or integration gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseTransition {
    pub phase: DeploymentPhase,
    pub at: u64,
}

/// Audit record of one deployment, persisted at every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentAttempt {
    pub id: AttemptId,
    pub environment: String,
    pub hostclass: String,
    pub strategy: DeploymentStrategy,
    pub image_id: String,
    /// Group serving production when the attempt started.
    pub stable_group: Option<String>,
    /// Group created by this attempt, if any.
    pub new_group: Option<String>,
    pub phase: DeploymentPhase,
    pub smoke: Option<TestOutcome>,
    pub integration: Option<TestOutcome>,
    pub error: Option<String>,
    pub history: Vec<PhaseTransition>,
    pub started_at: u64,
    pub updated_at: u64,
}
