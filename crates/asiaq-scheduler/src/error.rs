//! Scheduler error types.

use asiaq_config::ConfigError;
use asiaq_network::NetworkError;
use asiaq_state::StateError;
use thiserror::Error;

use crate::cloud::CloudError;

/// Errors that can occur while managing environments and provisioning.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("environment already exists: {0}")]
    EnvironmentExists(String),

    #[error("no {stage} image for hostclass {hostclass}")]
    NoImage { hostclass: String, stage: String },

    #[error("hostclass {hostclass}: {reason}")]
    Placement { hostclass: String, reason: String },

    #[error("smoke test failed for {hostclass} instance {instance}: {reason}")]
    SmokeTestFailure {
        hostclass: String,
        instance: String,
        reason: String,
    },

    #[error("provisioning failed at sequence {sequence} ({hostclass}): {reason}")]
    ProvisionFailure {
        sequence: u32,
        hostclass: String,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
