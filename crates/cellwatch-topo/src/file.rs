//! FileTopo: a topology server that holds the store file only per call.
//!
//! A [`TopoStore`] keeps redb's file lock for its whole lifetime, which
//! would shut every other writer out of a store a long-running watcher
//! reads from. `FileTopo` opens the store for each call and drops it
//! before returning, so operator tools can edit the same file between
//! cycles. Calls through one `FileTopo` take turns on the file; a lock
//! held elsewhere is retried briefly and then reported as
//! [`TopoError::Locked`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use cellwatch_core::{NodeAlias, NodeRecord, ShardReplication};

use crate::error::{TopoError, TopoResult};
use crate::server::{TopoFuture, TopoServer};
use crate::store::TopoStore;

const DEFAULT_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);

pub struct FileTopo {
    path: PathBuf,
    /// Serializes opens from this process.
    gate: Mutex<()>,
    attempts: u32,
    retry_delay: Duration,
}

impl FileTopo {
    /// Create the store file and its tables if needed, then release it.
    pub fn create(path: &Path) -> TopoResult<Self> {
        drop(TopoStore::open_with_retry(path, DEFAULT_ATTEMPTS, DEFAULT_RETRY_DELAY)?);
        Ok(Self {
            path: path.to_path_buf(),
            gate: Mutex::new(()),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Override how long a call waits for a lock held elsewhere.
    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the store, run `read` against it, and release the file.
    async fn with_store<T: Send>(
        &self,
        read: impl FnOnce(&TopoStore) -> TopoResult<T> + Send,
    ) -> TopoResult<T> {
        let _gate = self.gate.lock().await;
        let mut attempt = 1;
        loop {
            match TopoStore::open(&self.path) {
                Ok(store) => return read(&store),
                Err(TopoError::Locked(_)) if attempt < self.attempts => {
                    debug!(path = ?self.path, attempt, "topology store locked, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl TopoServer for FileTopo {
    fn list_aliases_in_cell<'a>(&'a self, cell: &'a str) -> TopoFuture<'a, Vec<NodeAlias>> {
        Box::pin(self.with_store(move |store| store.list_aliases(cell)))
    }

    fn get_shard_replication<'a>(
        &'a self,
        cell: &'a str,
        keyspace: &'a str,
        shard: &'a str,
    ) -> TopoFuture<'a, ShardReplication> {
        Box::pin(self.with_store(move |store| {
            store.require_shard_replication(cell, keyspace, shard)
        }))
    }

    fn get_node_record<'a>(&'a self, alias: &'a NodeAlias) -> TopoFuture<'a, NodeRecord> {
        Box::pin(self.with_store(move |store| store.require_node_record(alias)))
    }
}
