//! The topology service capability set.
//!
//! Methods return boxed futures so the trait stays object-safe and can be
//! shared as `Arc<dyn TopoServer>` between a watcher and its fetch tasks.
//! Remote implementations honour cancellation by stopping work when the
//! returned future is dropped.

use std::future::Future;
use std::pin::Pin;

use cellwatch_core::{NodeAlias, NodeRecord, ShardReplication};

use crate::error::TopoResult;

/// Boxed future alias for topology calls.
pub type TopoFuture<'a, T> = Pin<Box<dyn Future<Output = TopoResult<T>> + Send + 'a>>;

/// Read access to the authoritative topology service.
pub trait TopoServer: Send + Sync {
    /// List the aliases of every node registered under `cell`.
    fn list_aliases_in_cell<'a>(&'a self, cell: &'a str) -> TopoFuture<'a, Vec<NodeAlias>>;

    /// Read the replication graph of `keyspace/shard` in `cell`.
    ///
    /// A shard with no graph in that cell is `TopoError::NotFound`.
    fn get_shard_replication<'a>(
        &'a self,
        cell: &'a str,
        keyspace: &'a str,
        shard: &'a str,
    ) -> TopoFuture<'a, ShardReplication>;

    /// Read the full record of a single node.
    fn get_node_record<'a>(&'a self, alias: &'a NodeAlias) -> TopoFuture<'a, NodeRecord>;
}
