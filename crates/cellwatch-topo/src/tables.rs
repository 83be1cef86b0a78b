//! redb table definitions for the topology store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Node records keyed by `{cell}/{uid:010}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Shard replication graphs keyed by `{cell}/{keyspace}/{shard}`.
pub const SHARD_REPLICATION: TableDefinition<&str, &[u8]> =
    TableDefinition::new("shard_replication");
