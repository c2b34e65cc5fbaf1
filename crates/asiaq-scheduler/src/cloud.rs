//! Collaborator traits: the compute/load-balancer provider and the smoke probe.
//!
//! The scheduler and the deployment orchestrator only ever talk to the
//! outside world through these. [`LocalCloud`](crate::local::LocalCloud) is
//! the store-backed implementation used by the CLI and in tests.

use async_trait::async_trait;
use thiserror::Error;

use asiaq_state::{AutoscalingGroup, Instance, InstanceId, LoadBalancerRegistration, Snapshot, StateError};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("group not found: {environment}/{group}")]
    GroupNotFound { environment: String, group: String },

    #[error("launch failed for {group}: {reason}")]
    LaunchFailed { group: String, reason: String },

    #[error("no free address in {0}")]
    AddressExhausted(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Compute and load-balancer provider.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Create the group, or update it in place, and converge its instances
    /// to the desired size.
    async fn put_group(&self, group: AutoscalingGroup) -> CloudResult<AutoscalingGroup>;

    async fn find_group(&self, environment: &str, name: &str) -> CloudResult<Option<AutoscalingGroup>>;

    async fn list_groups(&self, environment: &str) -> CloudResult<Vec<AutoscalingGroup>>;

    /// Swap the group's image and replace its instances.
    async fn set_group_image(
        &self,
        environment: &str,
        name: &str,
        image_id: &str,
    ) -> CloudResult<AutoscalingGroup>;

    /// Terminate every instance of the group and delete it. Returns whether
    /// the group existed.
    async fn destroy_group(&self, environment: &str, name: &str) -> CloudResult<bool>;

    /// Live instances of the environment, or of one group.
    async fn list_instances(&self, environment: &str, group: Option<&str>) -> CloudResult<Vec<Instance>>;

    /// Returns the number of instances actually terminated.
    async fn terminate_instances(&self, environment: &str, ids: &[InstanceId]) -> CloudResult<u32>;

    async fn latest_snapshot(&self, hostclass: &str) -> CloudResult<Option<Snapshot>>;

    async fn attach_load_balancer(
        &self,
        environment: &str,
        group: &str,
        registration: LoadBalancerRegistration,
    ) -> CloudResult<()>;

    /// True once every desired instance is registered and in service.
    async fn load_balancer_healthy(&self, environment: &str, group: &str) -> CloudResult<bool>;

    /// Clear the testing tag so the group takes production traffic and
    /// joins chaos runs.
    async fn exit_test_mode(&self, environment: &str, group: &str) -> CloudResult<()>;
}

/// Result of one smoke probe against one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeStatus {
    Passed,
    Pending,
    Failed(String),
}

/// Decides whether an instance has come up healthy.
#[async_trait]
pub trait SmokeProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> SmokeStatus;
}
