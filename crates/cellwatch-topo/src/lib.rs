//! cellwatch-topo - the topology service as seen by cellwatch.
//!
//! [`TopoServer`] is the capability set the discovery layer consumes:
//! list the aliases of a cell, read a shard's replication graph, and read
//! a single node record. [`TopoStore`] implements it on top of
//! [redb](https://docs.rs/redb), either on disk or in memory.
//! [`FileTopo`] implements it over an on-disk store that it opens per
//! call, leaving the file free for other writers between calls.
//!
//! # Architecture
//!
//! Node records and replication graphs are JSON-serialized into redb's
//! `&[u8]` value columns. Node keys are `{cell}/{uid:010}`, so listing a
//! cell is a range scan over the `{cell}/` prefix. Replication graphs are
//! keyed by `{cell}/{keyspace}/{shard}`.

pub mod error;
pub mod file;
pub mod server;
pub mod store;
pub mod tables;

pub use error::{TopoError, TopoResult};
pub use file::FileTopo;
pub use server::{TopoFuture, TopoServer};
pub use store::TopoStore;
