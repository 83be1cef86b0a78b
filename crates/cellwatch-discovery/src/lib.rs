//! cellwatch-discovery - keeps a health-check registry in step with the
//! topology service.
//!
//! A [`TopologyWatcher`] periodically lists the nodes of its scope (a
//! cell, or a shard's replication graph within a cell), fetches every
//! node record with bounded concurrency, diffs the resulting endpoint
//! keys against what it pushed last time, and tells the registry to add
//! or remove endpoints accordingly.
//!
//! # Architecture
//!
//! ```text
//! TopologyWatcher
//!   ├── Background loop (first cycle immediately, then every refresh interval)
//!   └── load_tablets(): one cycle, serialized by the snapshot lock
//!       ├── ScopeResolver::resolve() → aliases      (failure aborts the cycle)
//!       ├── FetchPool::fetch() → alias → record     (≤ N in flight)
//!       ├── diff(snapshot, candidate) → changes
//!       └── HealthCheck::{remove_endpoint, add_endpoint}
//! ```
//!
//! # Failure policy
//!
//! A failed scope resolution leaves the registry and the retained
//! snapshot untouched; the next tick retries. A node whose record cannot
//! be fetched is treated as absent for that cycle, so its endpoint is
//! removed and re-added once the record is readable again.

pub mod error;
pub mod fetch;
pub mod scope;
pub mod stats;
pub mod watcher;

pub use error::{DiscoveryError, DiscoveryResult};
pub use fetch::{FetchPool, FetchResults};
pub use scope::ScopeResolver;
pub use stats::WatcherStats;
pub use watcher::{CycleReport, EndpointChange, TopologyWatcher, WatcherState};
