//! Chaos error types.

use asiaq_scheduler::CloudError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("{name} must be a percentage between 0 and 100, got {value}")]
    InvalidPercentage { name: &'static str, value: f64 },

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
}

pub type ChaosResult<T> = Result<T, ChaosError>;
