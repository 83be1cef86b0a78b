//! Domain types shared across cellwatch crates.
//!
//! These mirror the records held by the topology service: node aliases,
//! full node records, and per-shard replication graphs. All types are
//! serializable to/from JSON for storage in the topology store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric identifier of a node, unique within its cell.
pub type Uid = u32;

// ── Alias ─────────────────────────────────────────────────────────

/// Stable identity of a storage node: the cell it is registered in
/// plus a numeric id unique within that cell.
///
/// Host and port changes never change the alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAlias {
    pub cell: String,
    pub uid: Uid,
}

impl NodeAlias {
    pub fn new(cell: impl Into<String>, uid: Uid) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }

    /// Build the composite key for the nodes table.
    ///
    /// The uid is zero-padded so keys of one cell sort numerically.
    pub fn table_key(&self) -> String {
        format!("{}/{:010}", self.cell, self.uid)
    }
}

impl fmt::Display for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

// ── Node record ───────────────────────────────────────────────────

/// Full record for a node as stored by the topology service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub alias: NodeAlias,
    pub hostname: String,
    /// Named port roles (e.g. "vt", "grpc") to port numbers.
    pub port_map: BTreeMap<String, u16>,
}

impl NodeRecord {
    pub fn new(alias: NodeAlias, hostname: impl Into<String>) -> Self {
        Self {
            alias,
            hostname: hostname.into(),
            port_map: BTreeMap::new(),
        }
    }

    /// Add a named port, replacing any previous value for that name.
    pub fn with_port(mut self, name: impl Into<String>, port: u16) -> Self {
        self.port_map.insert(name.into(), port);
        self
    }
}

// ── Shard replication ─────────────────────────────────────────────

/// One entry of a shard's replication graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationNode {
    pub alias: NodeAlias,
}

/// The replication graph of a shard as seen from one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplication {
    pub cell: String,
    pub keyspace: String,
    pub shard: String,
    pub nodes: Vec<ReplicationNode>,
}

impl ShardReplication {
    /// An empty graph for the given shard.
    pub fn new(
        cell: impl Into<String>,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            cell: cell.into(),
            keyspace: keyspace.into(),
            shard: shard.into(),
            nodes: Vec::new(),
        }
    }

    /// Build the composite key for the shard replication table.
    pub fn table_key(&self) -> String {
        shard_replication_key(&self.cell, &self.keyspace, &self.shard)
    }

    /// Aliases of every node in the graph.
    pub fn aliases(&self) -> Vec<NodeAlias> {
        self.nodes.iter().map(|n| n.alias.clone()).collect()
    }

    /// Whether the graph already references `alias`.
    pub fn contains(&self, alias: &NodeAlias) -> bool {
        self.nodes.iter().any(|n| &n.alias == alias)
    }
}

/// Composite key `{cell}/{keyspace}/{shard}` for a shard replication graph.
pub fn shard_replication_key(cell: &str, keyspace: &str, shard: &str) -> String {
    format!("{cell}/{keyspace}/{shard}")
}

// ── Scope ─────────────────────────────────────────────────────────

/// Which slice of the topology a watcher tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// Every node registered under a cell.
    Cell { cell: String },
    /// Every node referenced by a shard's replication graph in a cell.
    ShardReplication {
        cell: String,
        keyspace: String,
        shard: String,
    },
}

impl Scope {
    pub fn cell(&self) -> &str {
        match self {
            Scope::Cell { cell } | Scope::ShardReplication { cell, .. } => cell,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Cell { cell } => write!(f, "cell:{cell}"),
            Scope::ShardReplication {
                cell,
                keyspace,
                shard,
            } => write!(f, "shard:{cell}/{keyspace}/{shard}"),
        }
    }
}
