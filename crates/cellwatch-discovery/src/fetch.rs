//! Bounded fetch pool: reads node records in parallel.
//!
//! Each alias is fetched on its own task. A semaphore caps how many of
//! those tasks hold a topology call at once. The pool always drains every
//! task before returning, so a slow or failing alias never hides the
//! results of the others.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use cellwatch_core::{NodeAlias, NodeRecord};
use cellwatch_topo::{TopoError, TopoResult, TopoServer};

/// Outcome of a fetch round: one entry per distinct input alias.
pub type FetchResults = HashMap<NodeAlias, TopoResult<NodeRecord>>;

/// Concurrency-limited node record fetcher.
pub struct FetchPool {
    topo: Arc<dyn TopoServer>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl FetchPool {
    /// Create a pool running at most `concurrency` fetches at a time.
    ///
    /// A limit of zero is raised to one.
    pub fn new(topo: Arc<dyn TopoServer>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            topo,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch the record of every alias.
    ///
    /// Dropping the returned future aborts the fetches still in flight.
    pub async fn fetch(&self, aliases: &[NodeAlias]) -> FetchResults {
        // Every alias gets an entry even if its task never reports back.
        let mut results: FetchResults = aliases
            .iter()
            .map(|alias| {
                let pending = TopoError::Unavailable(format!("fetch of {alias} did not complete"));
                (alias.clone(), Err(pending))
            })
            .collect();

        let mut tasks = JoinSet::new();
        for alias in results.keys().cloned().collect::<Vec<_>>() {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed.
                Err(_) => break,
            };
            let topo = Arc::clone(&self.topo);
            tasks.spawn(async move {
                let _permit = permit;
                let result = topo.get_node_record(&alias).await;
                (alias, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((alias, result)) => {
                    results.insert(alias, result);
                }
                Err(e) => {
                    warn!(error = %e, "node record fetch task failed");
                }
            }
        }

        results
    }
}
