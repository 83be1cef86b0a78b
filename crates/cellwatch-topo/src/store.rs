//! TopoStore: redb-backed topology storage.
//!
//! Provides typed CRUD over node records and shard replication graphs and
//! implements [`TopoServer`] on top of them. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::debug;

use cellwatch_core::{
    shard_replication_key, NodeAlias, NodeRecord, ReplicationNode, ShardReplication,
};

use crate::error::{TopoError, TopoResult};
use crate::server::{TopoFuture, TopoServer};
use crate::tables::*;

/// Convert any `Display` error into a `TopoError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| TopoError::$variant(e.to_string())
    };
}

/// Thread-safe topology store backed by redb.
#[derive(Clone)]
pub struct TopoStore {
    db: Arc<Database>,
}

impl TopoStore {
    /// Open (or create) a persistent topology store at the given path.
    ///
    /// redb locks the file for as long as the store is alive; a second
    /// open, from this process or another, fails with [`TopoError::Locked`].
    pub fn open(path: &Path) -> TopoResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => TopoError::Locked(path.display().to_string()),
            other => TopoError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "topology store opened");
        Ok(store)
    }

    /// Open a persistent store, waiting out another holder of the file lock.
    ///
    /// Tries up to `attempts` times, sleeping `delay` between tries.
    pub fn open_with_retry(path: &Path, attempts: u32, delay: Duration) -> TopoResult<Self> {
        let mut attempt = 1;
        loop {
            match Self::open(path) {
                Err(TopoError::Locked(_)) if attempt < attempts => {
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                result => return result,
            }
        }
    }

    /// Create an ephemeral in-memory topology store (for testing).
    pub fn open_in_memory() -> TopoResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory topology store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> TopoResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(SHARD_REPLICATION).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Node records ───────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node_record(&self, record: &NodeRecord) -> TopoResult<()> {
        let key = record.alias.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alias = %record.alias, host = %record.hostname, "node record stored");
        Ok(())
    }

    /// Get a node record, `None` if the alias is not registered.
    pub fn find_node_record(&self, alias: &NodeAlias) -> TopoResult<Option<NodeRecord>> {
        let key = alias.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every node record registered under `cell`.
    ///
    /// Node keys sort by cell first, so this is a range scan starting at
    /// `{cell}/` that stops at the first key of another cell.
    pub fn list_node_records(&self, cell: &str) -> TopoResult<Vec<NodeRecord>> {
        let prefix = format!("{cell}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List the aliases registered under `cell`.
    pub fn list_aliases(&self, cell: &str) -> TopoResult<Vec<NodeAlias>> {
        Ok(self
            .list_node_records(cell)?
            .into_iter()
            .map(|r| r.alias)
            .collect())
    }

    /// Delete a node record. Returns true if it existed.
    pub fn delete_node_record(&self, alias: &NodeAlias) -> TopoResult<bool> {
        let key = alias.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alias, existed, "node record deleted");
        Ok(existed)
    }

    // ── Shard replication ──────────────────────────────────────────

    /// Get a replication graph, `None` if the shard has none in `cell`.
    pub fn find_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> TopoResult<Option<ShardReplication>> {
        let key = shard_replication_key(cell, keyspace, shard);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SHARD_REPLICATION).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let graph: ShardReplication =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(graph))
            }
            None => Ok(None),
        }
    }

    /// Add `alias` to a shard's replication graph, creating the graph if needed.
    ///
    /// Returns false if the alias was already present.
    pub fn add_shard_replication_node(
        &self,
        keyspace: &str,
        shard: &str,
        alias: &NodeAlias,
    ) -> TopoResult<bool> {
        self.update_shard_replication(&alias.cell, keyspace, shard, |graph| {
            if graph.contains(alias) {
                return false;
            }
            graph.nodes.push(ReplicationNode {
                alias: alias.clone(),
            });
            true
        })
    }

    /// Remove `alias` from a shard's replication graph.
    ///
    /// Returns false if the alias was not part of the graph.
    pub fn remove_shard_replication_node(
        &self,
        keyspace: &str,
        shard: &str,
        alias: &NodeAlias,
    ) -> TopoResult<bool> {
        self.update_shard_replication(&alias.cell, keyspace, shard, |graph| {
            let before = graph.nodes.len();
            graph.nodes.retain(|n| &n.alias != alias);
            graph.nodes.len() != before
        })
    }

    /// Read-modify-write a replication graph in a single write transaction.
    fn update_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        apply: impl FnOnce(&mut ShardReplication) -> bool,
    ) -> TopoResult<bool> {
        let key = shard_replication_key(cell, keyspace, shard);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let changed;
        {
            let mut table = txn.open_table(SHARD_REPLICATION).map_err(map_err!(Table))?;
            let existing: Option<ShardReplication> = match table
                .get(key.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let mut graph =
                existing.unwrap_or_else(|| ShardReplication::new(cell, keyspace, shard));

            changed = apply(&mut graph);
            if changed {
                let value = serde_json::to_vec(&graph).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, changed, "shard replication updated");
        Ok(changed)
    }
}

impl TopoStore {
    /// Like [`find_shard_replication`](Self::find_shard_replication), but a
    /// missing graph is [`TopoError::NotFound`].
    pub(crate) fn require_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> TopoResult<ShardReplication> {
        self.find_shard_replication(cell, keyspace, shard)?
            .ok_or_else(|| TopoError::NotFound(shard_replication_key(cell, keyspace, shard)))
    }

    pub(crate) fn require_node_record(&self, alias: &NodeAlias) -> TopoResult<NodeRecord> {
        self.find_node_record(alias)?
            .ok_or_else(|| TopoError::NotFound(alias.to_string()))
    }
}

impl TopoServer for TopoStore {
    fn list_aliases_in_cell<'a>(&'a self, cell: &'a str) -> TopoFuture<'a, Vec<NodeAlias>> {
        Box::pin(async move { self.list_aliases(cell) })
    }

    fn get_shard_replication<'a>(
        &'a self,
        cell: &'a str,
        keyspace: &'a str,
        shard: &'a str,
    ) -> TopoFuture<'a, ShardReplication> {
        Box::pin(async move { self.require_shard_replication(cell, keyspace, shard) })
    }

    fn get_node_record<'a>(&'a self, alias: &'a NodeAlias) -> TopoFuture<'a, NodeRecord> {
        Box::pin(async move { self.require_node_record(alias) })
    }
}
