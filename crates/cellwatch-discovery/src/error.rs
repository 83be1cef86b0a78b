//! Discovery error types.

use thiserror::Error;

use cellwatch_core::ConfigError;
use cellwatch_topo::TopoError;

/// Errors surfaced by topology watchers.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid watcher config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("watcher for {0} is already running")]
    AlreadyRunning(String),

    #[error("no tokio runtime to run the watcher on")]
    NoRuntime,

    #[error("cannot resolve topology scope: {0}")]
    Resolve(#[from] TopoError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
