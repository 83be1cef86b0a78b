//! Scope resolution: which node aliases a watcher is responsible for.

use cellwatch_core::{NodeAlias, Scope};
use cellwatch_topo::{TopoResult, TopoServer};

/// Lists the current aliases of a watcher's scope.
///
/// A cell scope lists the cell directly. A shard scope reads the shard's
/// replication graph in the cell and takes the alias of every node in it.
/// Either way a topology failure fails the whole resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeResolver {
    scope: Scope,
}

impl ScopeResolver {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub async fn resolve(&self, topo: &dyn TopoServer) -> TopoResult<Vec<NodeAlias>> {
        match &self.scope {
            Scope::Cell { cell } => topo.list_aliases_in_cell(cell).await,
            Scope::ShardReplication {
                cell,
                keyspace,
                shard,
            } => {
                let graph = topo.get_shard_replication(cell, keyspace, shard).await?;
                Ok(graph.aliases())
            }
        }
    }
}
