//! Configuration error types.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown key '{key}' in [{section}]")]
    UnknownKey { section: String, key: String },

    #[error("invalid value for '{key}' in [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: String,
    },

    #[error("missing '{key}' for {scope}")]
    MissingKey { scope: String, key: String },

    #[error("pipeline line {line}: {reason}")]
    Pipeline { line: usize, reason: String },
}
