//! Configuration errors.

use thiserror::Error;

/// Result type alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while validating watcher configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("cell must not be empty")]
    EmptyCell,

    #[error("keyspace and shard must be set together (cell {0})")]
    PartialShard(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("refresh interval must be non-zero")]
    ZeroInterval,
}
