//! Error types for network planning.

use thiserror::Error;

use crate::cidr::Cidr;

/// Result type alias for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised while parsing or allocating address space.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    #[error("no free /{prefix_len} left in {parent}")]
    AllocationExhausted { parent: Cidr, prefix_len: u8 },

    #[error("{range} overlaps {existing}")]
    OverlapConflict { range: Cidr, existing: Cidr },

    #[error("{range} is not inside {parent}")]
    NotContained { range: Cidr, parent: Cidr },

    #[error("invalid rule '{0}'")]
    InvalidRule(String),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("invalid address offset: {0}")]
    InvalidOffset(String),

    #[error("cannot partition {range}: {reason}")]
    Partition { range: Cidr, reason: String },

    #[error("topology error: {0}")]
    Topology(String),
}
