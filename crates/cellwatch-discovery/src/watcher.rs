//! Topology watcher: reconciles a scope's endpoints into a registry.
//!
//! Each cycle resolves the scope, fetches node records, and diffs their
//! endpoint keys against the snapshot retained from the previous cycle.
//! Only the diff reaches the registry. The snapshot lock is held for the
//! whole cycle, so cycles of one watcher never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cellwatch_core::{
    endpoint_key, ConfigError, EndpointKey, NodeAlias, NodeRecord, Scope, WatcherSettings,
};
use cellwatch_health::HealthCheck;
use cellwatch_topo::TopoServer;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::fetch::FetchPool;
use crate::scope::ScopeResolver;
use crate::stats::{Counters, WatcherStats};

/// Endpoint keys last pushed to the registry, by alias.
type Snapshot = HashMap<NodeAlias, EndpointKey>;

/// Endpoints observed in the current cycle, by alias.
type Candidate = HashMap<NodeAlias, (EndpointKey, NodeRecord)>;

/// Lifecycle state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Running,
    /// `stop()` was called and the loop has not exited yet.
    Stopping,
}

/// One registry mutation derived from a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointChange {
    Add {
        key: EndpointKey,
        record: NodeRecord,
    },
    Remove {
        key: EndpointKey,
    },
    /// Remove `old`, then add `new`.
    Replace {
        old: EndpointKey,
        new: EndpointKey,
        record: NodeRecord,
    },
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Aliases left out of this cycle because their record could not be read.
    pub fetch_errors: usize,
}

impl CycleReport {
    /// Whether the cycle issued any registry call.
    pub fn changed(&self) -> bool {
        self.added + self.removed + self.replaced > 0
    }
}

/// Handle to the background loop.
struct RunningTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// State shared between the watcher handle and its loop task.
struct WatcherInner {
    topo: Arc<dyn TopoServer>,
    health: Arc<dyn HealthCheck>,
    resolver: ScopeResolver,
    pool: FetchPool,
    refresh_interval: Duration,
    /// Held for the duration of a cycle.
    snapshot: tokio::sync::Mutex<Snapshot>,
    counters: Counters,
    /// Flips to true after the first successful cycle.
    initial_load: watch::Sender<bool>,
}

/// Watches one topology scope and keeps a [`HealthCheck`] registry in sync.
///
/// Constructed stopped; call [`start`](Self::start) to run the background
/// loop, which performs a cycle immediately and then once per refresh
/// interval. [`load_tablets`](Self::load_tablets) runs a single cycle on
/// demand.
pub struct TopologyWatcher {
    inner: Arc<WatcherInner>,
    /// Serializes start/stop and owns the loop handle.
    task: tokio::sync::Mutex<Option<RunningTask>>,
    state: Mutex<WatcherState>,
}

impl TopologyWatcher {
    /// Watch every node registered under `cell`.
    pub fn new_cell_watcher(
        topo: Arc<dyn TopoServer>,
        health: Arc<dyn HealthCheck>,
        cell: &str,
        refresh_interval: Duration,
        concurrency: usize,
    ) -> DiscoveryResult<Self> {
        let scope = Scope::Cell {
            cell: cell.to_string(),
        };
        Self::new(topo, health, scope, refresh_interval, concurrency)
    }

    /// Watch every node in the replication graph of `keyspace/shard` in `cell`.
    pub fn new_shard_replication_watcher(
        topo: Arc<dyn TopoServer>,
        health: Arc<dyn HealthCheck>,
        cell: &str,
        keyspace: &str,
        shard: &str,
        refresh_interval: Duration,
        concurrency: usize,
    ) -> DiscoveryResult<Self> {
        let scope = Scope::ShardReplication {
            cell: cell.to_string(),
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
        };
        Self::new(topo, health, scope, refresh_interval, concurrency)
    }

    /// Build a watcher from resolved configuration.
    pub fn from_settings(
        topo: Arc<dyn TopoServer>,
        health: Arc<dyn HealthCheck>,
        settings: &WatcherSettings,
    ) -> DiscoveryResult<Self> {
        Self::new(
            topo,
            health,
            settings.scope.clone(),
            settings.refresh_interval,
            settings.concurrency,
        )
    }

    fn new(
        topo: Arc<dyn TopoServer>,
        health: Arc<dyn HealthCheck>,
        scope: Scope,
        refresh_interval: Duration,
        concurrency: usize,
    ) -> DiscoveryResult<Self> {
        validate(&scope, refresh_interval, concurrency)?;

        let (initial_load, _) = watch::channel(false);
        let inner = WatcherInner {
            pool: FetchPool::new(Arc::clone(&topo), concurrency),
            topo,
            health,
            resolver: ScopeResolver::new(scope),
            refresh_interval,
            snapshot: tokio::sync::Mutex::new(Snapshot::new()),
            counters: Counters::default(),
            initial_load,
        };

        Ok(Self {
            inner: Arc::new(inner),
            task: tokio::sync::Mutex::new(None),
            state: Mutex::new(WatcherState::Stopped),
        })
    }

    pub fn scope(&self) -> &Scope {
        self.inner.resolver.scope()
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().expect("state lock")
    }

    pub fn stats(&self) -> WatcherStats {
        self.inner.counters.snapshot()
    }

    /// Spawn the background loop on the current tokio runtime.
    ///
    /// A stopped watcher can be started again; it keeps its snapshot.
    pub async fn start(&self) -> DiscoveryResult<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DiscoveryError::AlreadyRunning(self.scope().to_string()));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            run_watch_loop(inner, shutdown_rx).await;
        });

        *task = Some(RunningTask {
            handle,
            shutdown_tx,
        });
        self.set_state(WatcherState::Running);

        info!(
            scope = %self.scope(),
            interval = ?self.inner.refresh_interval,
            concurrency = self.inner.pool.concurrency(),
            "topology watcher started"
        );
        Ok(())
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// A cycle still resolving or fetching is abandoned without touching
    /// the registry; a cycle already applying its diff finishes first.
    /// Once this returns the loop makes no further registry calls.
    /// Calling it on a stopped watcher, or twice, is a no-op.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return;
        };
        self.set_state(WatcherState::Stopping);

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(scope = %self.scope(), error = %e, "topology watcher loop ended abnormally");
        }

        self.set_state(WatcherState::Stopped);
        info!(scope = %self.scope(), "topology watcher stopped");
    }

    /// Run one cycle now.
    ///
    /// Waits for any cycle already in progress. Failures are also logged
    /// and counted as they are for background cycles.
    pub async fn load_tablets(&self) -> DiscoveryResult<CycleReport> {
        self.inner.load_tablets().await
    }

    /// Resolve once the first successful cycle has been applied.
    pub async fn wait_for_initial_load(&self) {
        let mut rx = self.inner.initial_load.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    fn set_state(&self, state: WatcherState) {
        *self.state.lock().expect("state lock") = state;
    }
}

impl Drop for TopologyWatcher {
    fn drop(&mut self) {
        if let Some(running) = self.task.get_mut().take() {
            let _ = running.shutdown_tx.send(true);
            running.handle.abort();
            debug!(scope = %self.inner.resolver.scope(), "topology watcher dropped while running");
        }
    }
}

impl WatcherInner {
    async fn load_tablets(&self) -> DiscoveryResult<CycleReport> {
        let mut snapshot = self.snapshot.lock().await;
        let scope = self.resolver.scope();

        let aliases = match self.resolver.resolve(self.topo.as_ref()).await {
            Ok(aliases) => aliases,
            Err(e) => {
                self.counters.record_resolve_error();
                warn!(%scope, error = %e, "cannot resolve topology scope, keeping previous endpoints");
                return Err(e.into());
            }
        };

        let fetched = self.pool.fetch(&aliases).await;

        let mut candidate = Candidate::with_capacity(fetched.len());
        let mut fetch_errors = 0;
        for (alias, result) in fetched {
            match result {
                Ok(record) => {
                    candidate.insert(alias, (endpoint_key(&record), record));
                }
                Err(e) => {
                    fetch_errors += 1;
                    warn!(%scope, %alias, error = %e, "cannot get node record, treating as absent");
                }
            }
        }

        // Nothing below suspends, so a started diff is always applied in full.
        let changes = diff(&snapshot, &candidate);
        let unchanged = candidate
            .iter()
            .filter(|(alias, (key, _))| snapshot.get(*alias) == Some(key))
            .count();
        let mut report = apply_changes(self.health.as_ref(), &changes);
        report.unchanged = unchanged;
        report.fetch_errors = fetch_errors;

        *snapshot = candidate
            .into_iter()
            .map(|(alias, (key, _))| (alias, key))
            .collect();

        self.counters.record_cycle(
            report.added as u64,
            report.removed as u64,
            report.replaced as u64,
            report.fetch_errors as u64,
        );
        self.initial_load.send_if_modified(|loaded| !std::mem::replace(loaded, true));

        if report.changed() {
            info!(
                %scope,
                added = report.added,
                removed = report.removed,
                replaced = report.replaced,
                endpoints = snapshot.len(),
                "topology change applied"
            );
        } else {
            debug!(%scope, endpoints = snapshot.len(), "topology unchanged");
        }

        Ok(report)
    }
}

/// Background loop: one cycle now, then one per refresh interval.
async fn run_watch_loop(inner: Arc<WatcherInner>, mut shutdown: watch::Receiver<bool>) {
    let scope = inner.resolver.scope().clone();
    debug!(%scope, "watch loop starting");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!(%scope, "watch loop shutting down mid-cycle");
                break;
            }
            // Errors are already logged and counted inside the cycle.
            _ = inner.load_tablets() => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!(%scope, "watch loop shutting down");
                break;
            }
            _ = tokio::time::sleep(inner.refresh_interval) => {}
        }
    }
}

/// Compute the registry changes that turn `retained` into `candidate`.
///
/// Changes come out ordered by alias.
pub(crate) fn diff(retained: &Snapshot, candidate: &Candidate) -> Vec<EndpointChange> {
    let mut changes = Vec::new();

    for (alias, old_key) in retained {
        if !candidate.contains_key(alias) {
            changes.push((
                alias.clone(),
                EndpointChange::Remove {
                    key: old_key.clone(),
                },
            ));
        }
    }

    for (alias, (key, record)) in candidate {
        match retained.get(alias) {
            None => changes.push((
                alias.clone(),
                EndpointChange::Add {
                    key: key.clone(),
                    record: record.clone(),
                },
            )),
            Some(old_key) if old_key != key => changes.push((
                alias.clone(),
                EndpointChange::Replace {
                    old: old_key.clone(),
                    new: key.clone(),
                    record: record.clone(),
                },
            )),
            Some(_) => {}
        }
    }

    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes.into_iter().map(|(_, change)| change).collect()
}

fn apply_changes(health: &dyn HealthCheck, changes: &[EndpointChange]) -> CycleReport {
    let mut report = CycleReport::default();
    for change in changes {
        match change {
            EndpointChange::Add { key, record } => {
                debug!(%key, "adding endpoint");
                health.add_endpoint(key, record);
                report.added += 1;
            }
            EndpointChange::Remove { key } => {
                debug!(%key, "removing endpoint");
                health.remove_endpoint(key);
                report.removed += 1;
            }
            EndpointChange::Replace { old, new, record } => {
                debug!(%old, %new, "replacing endpoint");
                health.remove_endpoint(old);
                health.add_endpoint(new, record);
                report.replaced += 1;
            }
        }
    }
    report
}

fn validate(scope: &Scope, refresh_interval: Duration, concurrency: usize) -> Result<(), ConfigError> {
    if scope.cell().trim().is_empty() {
        return Err(ConfigError::EmptyCell);
    }
    if let Scope::ShardReplication {
        cell,
        keyspace,
        shard,
    } = scope
    {
        if keyspace.is_empty() || shard.is_empty() {
            return Err(ConfigError::PartialShard(cell.clone()));
        }
    }
    if refresh_interval.is_zero() {
        return Err(ConfigError::ZeroInterval);
    }
    if concurrency == 0 {
        return Err(ConfigError::ZeroConcurrency);
    }
    Ok(())
}
