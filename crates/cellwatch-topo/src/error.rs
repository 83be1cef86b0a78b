//! Error types for topology access.

use thiserror::Error;

/// Result type alias for topology operations.
pub type TopoResult<T> = Result<T, TopoError>;

/// Errors that can occur while talking to the topology service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopoError {
    #[error("failed to open topology store: {0}")]
    Open(String),

    #[error("topology store {0} is locked by another handle")]
    Locked(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("topology service unavailable: {0}")]
    Unavailable(String),
}
