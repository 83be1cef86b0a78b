//! cellwatch-core - shared data model for the cellwatch crates.
//!
//! Defines node aliases and records as the topology service stores them,
//! the endpoint key used to index the health-check registry, watcher
//! scopes, and the `cellwatch.toml` configuration format.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod types;

pub use config::{CellwatchConfig, WatcherSettings};
pub use endpoint::{endpoint_key, EndpointKey};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
