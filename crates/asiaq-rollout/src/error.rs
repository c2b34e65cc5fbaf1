//! Rollout error types.

use asiaq_config::ConfigError;
use asiaq_scheduler::{CloudError, SchedulerError};
use asiaq_state::{DeploymentPhase, StateError};
use thiserror::Error;

use crate::remote::ExecError;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("attempt {attempt}: cannot move from {from} to {to}")]
    InvalidTransition {
        attempt: String,
        from: DeploymentPhase,
        to: String,
    },

    #[error("no production group for hostclass {0}")]
    NoStableGroup(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("hostclass {hostclass}: {reason}")]
    Misconfigured { hostclass: String, reason: String },

    #[error("integration test failed for {hostclass}: {reason}")]
    IntegrationTestFailure { hostclass: String, reason: String },

    #[error("load balancer for {group} not healthy after {secs}s")]
    Unhealthy { group: String, secs: u64 },

    #[error("random source lock poisoned")]
    RandomSourcePoisoned,

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("remote exec error: {0}")]
    Exec(#[from] ExecError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
