//! Integration tests for the topology watcher.
//!
//! These tests drive full cycles against an in-memory topology store
//! wrapped in an instrumented fake, and record every registry call:
//! 1. First sight adds, disappearance removes, a port change replaces
//! 2. Repeated cycles without topology changes issue no calls
//! 3. Scope-resolution failures leave the registry untouched
//! 4. Fetch failures drop the alias for that cycle only
//! 5. Fetch fan-out never exceeds the configured concurrency
//! 6. The background loop ticks on its interval and stops cleanly

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::Notify;

use cellwatch_core::{endpoint_key, EndpointKey, NodeAlias, NodeRecord, ShardReplication};
use cellwatch_discovery::{DiscoveryError, TopologyWatcher, WatcherState};
use cellwatch_health::{EndpointRegistry, HealthCheck};
use cellwatch_topo::{TopoError, TopoFuture, TopoServer, TopoStore};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=cellwatch_discovery=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Fakes ────────────────────────────────────────────────────────

/// Topology store wrapper with failure injection and fetch accounting.
#[derive(Default)]
struct InstrumentedTopo {
    store: Option<TopoStore>,
    fail_resolve: AtomicBool,
    failing: Mutex<HashSet<NodeAlias>>,
    fetch_delay: Mutex<Duration>,
    /// While set, fetches park forever after signalling `entered`.
    hold: AtomicBool,
    entered: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InstrumentedTopo {
    fn new(store: TopoStore) -> Self {
        Self {
            store: Some(store),
            ..Default::default()
        }
    }

    fn store(&self) -> &TopoStore {
        self.store.as_ref().expect("store configured")
    }

    fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    fn fail_fetch(&self, alias: &NodeAlias) {
        self.failing.lock().unwrap().insert(alias.clone());
    }

    fn heal_fetches(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn resolve<'a, T: Send + 'a>(
        &'a self,
        call: impl Future<Output = Result<T, TopoError>> + Send + 'a,
    ) -> TopoFuture<'a, T> {
        Box::pin(async move {
            if self.fail_resolve.load(Ordering::SeqCst) {
                return Err(TopoError::Unavailable("injected resolve failure".to_string()));
            }
            call.await
        })
    }
}

impl TopoServer for InstrumentedTopo {
    fn list_aliases_in_cell<'a>(&'a self, cell: &'a str) -> TopoFuture<'a, Vec<NodeAlias>> {
        self.resolve(self.store().list_aliases_in_cell(cell))
    }

    fn get_shard_replication<'a>(
        &'a self,
        cell: &'a str,
        keyspace: &'a str,
        shard: &'a str,
    ) -> TopoFuture<'a, ShardReplication> {
        self.resolve(self.store().get_shard_replication(cell, keyspace, shard))
    }

    fn get_node_record<'a>(&'a self, alias: &'a NodeAlias) -> TopoFuture<'a, NodeRecord> {
        Box::pin(async move {
            let failing = self.failing.lock().unwrap().contains(alias);
            let delay = *self.fetch_delay.lock().unwrap();

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlightGuard(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);

            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if failing {
                return Err(TopoError::Unavailable(format!("injected fetch failure for {alias}")));
            }
            self.store().get_node_record(alias).await
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Add(EndpointKey),
    Remove(EndpointKey),
}

/// Registry that records every call before applying it.
#[derive(Default)]
struct RecordingHealth {
    registry: EndpointRegistry,
    ops: Mutex<Vec<Op>>,
}

impl RecordingHealth {
    fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    fn keys(&self) -> Vec<EndpointKey> {
        self.registry.endpoints().into_iter().map(|(k, _)| k).collect()
    }
}

impl HealthCheck for RecordingHealth {
    fn add_endpoint(&self, key: &EndpointKey, record: &NodeRecord) {
        self.ops.lock().unwrap().push(Op::Add(key.clone()));
        self.registry.add_endpoint(key, record);
    }

    fn remove_endpoint(&self, key: &EndpointKey) {
        self.ops.lock().unwrap().push(Op::Remove(key.clone()));
        self.registry.remove_endpoint(key);
    }
}

// ── Helpers ──────────────────────────────────────────────────────

const LONG_INTERVAL: Duration = Duration::from_secs(600);

fn add_tablet(store: &TopoStore, cell: &str, uid: u32, host: &str, ports: &[(&str, u16)]) -> NodeRecord {
    let record = ports.iter().fold(
        NodeRecord::new(NodeAlias::new(cell, uid), host),
        |r, (name, port)| r.with_port(*name, *port),
    );
    store.put_node_record(&record).unwrap();
    record
}

fn fixture() -> (Arc<InstrumentedTopo>, Arc<RecordingHealth>) {
    init_tracing();
    let topo = Arc::new(InstrumentedTopo::new(TopoStore::open_in_memory().unwrap()));
    (topo, Arc::new(RecordingHealth::default()))
}

fn cell_watcher(
    topo: &Arc<InstrumentedTopo>,
    health: &Arc<RecordingHealth>,
    interval: Duration,
    concurrency: usize,
) -> TopologyWatcher {
    TopologyWatcher::new_cell_watcher(topo.clone(), health.clone(), "aa", interval, concurrency)
        .unwrap()
}

// ── Reference scenario ───────────────────────────────────────────

async fn check_port_change_replaces_endpoint(shard_scoped: bool) {
    let (topo, health) = fixture();
    let watcher = if shard_scoped {
        TopologyWatcher::new_shard_replication_watcher(
            topo.clone(),
            health.clone(),
            "aa",
            "keyspace",
            "shard",
            LONG_INTERVAL,
            5,
        )
        .unwrap()
    } else {
        cell_watcher(&topo, &health, LONG_INTERVAL, 5)
    };

    let first = add_tablet(topo.store(), "aa", 0, "host1", &[("vt", 123)]);
    topo.store()
        .add_shard_replication_node("keyspace", "shard", &first.alias)
        .unwrap();
    watcher.load_tablets().await.unwrap();
    assert_eq!(health.keys(), vec![endpoint_key(&first)]);

    // Same tablet, different port: the old endpoint goes away.
    let moved = add_tablet(topo.store(), "aa", 0, "host1", &[("vt", 456)]);
    watcher.load_tablets().await.unwrap();
    assert_eq!(health.keys(), vec![endpoint_key(&moved)]);
    assert!(!health.registry.contains(&endpoint_key(&first)));

    watcher.stop().await;
}

#[tokio::test]
async fn cell_watcher_follows_port_change() {
    check_port_change_replaces_endpoint(false).await;
}

#[tokio::test]
async fn shard_replication_watcher_follows_port_change() {
    check_port_change_replaces_endpoint(true).await;
}

// ── Diff semantics ───────────────────────────────────────────────

#[tokio::test]
async fn first_sight_adds_each_endpoint_once() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let records: Vec<_> = (0..4)
        .map(|uid| add_tablet(topo.store(), "aa", uid, &format!("host{uid}"), &[("vt", 15100)]))
        .collect();

    let report = watcher.load_tablets().await.unwrap();

    assert_eq!(report.added, 4);
    let mut ops = health.take_ops();
    ops.sort_by_key(|op| format!("{op:?}"));
    let mut expected: Vec<_> = records.iter().map(|r| Op::Add(endpoint_key(r))).collect();
    expected.sort_by_key(|op| format!("{op:?}"));
    assert_eq!(ops, expected);
}

#[tokio::test]
async fn unchanged_topology_issues_no_calls() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    add_tablet(topo.store(), "aa", 0, "host1", &[("vt", 1)]);
    add_tablet(topo.store(), "aa", 1, "host2", &[("vt", 1), ("grpc", 2)]);

    watcher.load_tablets().await.unwrap();
    health.take_ops();

    let report = watcher.load_tablets().await.unwrap();
    assert!(!report.changed());
    assert_eq!(report.unchanged, 2);
    assert!(health.take_ops().is_empty());
}

#[tokio::test]
async fn disappearance_removes_last_known_key() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let gone = add_tablet(topo.store(), "aa", 0, "host1", &[("vt", 1)]);
    let kept = add_tablet(topo.store(), "aa", 1, "host2", &[("vt", 1)]);
    watcher.load_tablets().await.unwrap();
    health.take_ops();

    topo.store().delete_node_record(&gone.alias).unwrap();
    let report = watcher.load_tablets().await.unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(health.take_ops(), vec![Op::Remove(endpoint_key(&gone))]);
    assert_eq!(health.keys(), vec![endpoint_key(&kept)]);
}

#[tokio::test]
async fn host_change_removes_then_adds() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let before = add_tablet(topo.store(), "aa", 3, "host1", &[("vt", 1)]);
    watcher.load_tablets().await.unwrap();
    health.take_ops();

    let after = add_tablet(topo.store(), "aa", 3, "host9", &[("vt", 1)]);
    let report = watcher.load_tablets().await.unwrap();

    assert_eq!(report.replaced, 1);
    assert_eq!(
        health.take_ops(),
        vec![Op::Remove(endpoint_key(&before)), Op::Add(endpoint_key(&after))]
    );
    assert_eq!(health.registry.len(), 1);
}

#[tokio::test]
async fn emptied_cell_removes_everything() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let a = add_tablet(topo.store(), "aa", 0, "h", &[("vt", 1)]);
    let b = add_tablet(topo.store(), "aa", 1, "h", &[("vt", 1)]);
    watcher.load_tablets().await.unwrap();

    topo.store().delete_node_record(&a.alias).unwrap();
    topo.store().delete_node_record(&b.alias).unwrap();
    let report = watcher.load_tablets().await.unwrap();

    // An empty listing is a real answer, not a failure.
    assert_eq!(report.removed, 2);
    assert!(health.registry.is_empty());
}

#[tokio::test]
async fn shard_scope_ignores_nodes_outside_the_graph() {
    let (topo, health) = fixture();
    let watcher = TopologyWatcher::new_shard_replication_watcher(
        topo.clone(),
        health.clone(),
        "aa",
        "commerce",
        "-80",
        LONG_INTERVAL,
        5,
    )
    .unwrap();

    let member = add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);
    add_tablet(topo.store(), "aa", 1, "h1", &[("vt", 1)]);
    topo.store()
        .add_shard_replication_node("commerce", "-80", &member.alias)
        .unwrap();

    watcher.load_tablets().await.unwrap();
    assert_eq!(health.keys(), vec![endpoint_key(&member)]);

    // Leaving the graph removes the endpoint even though the record remains.
    topo.store()
        .remove_shard_replication_node("commerce", "-80", &member.alias)
        .unwrap();
    watcher.load_tablets().await.unwrap();
    assert!(health.registry.is_empty());
}

// ── Failure handling ─────────────────────────────────────────────

#[tokio::test]
async fn resolve_failure_leaves_registry_untouched() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let survivor = add_tablet(topo.store(), "aa", 0, "h", &[("vt", 1)]);
    watcher.load_tablets().await.unwrap();
    health.take_ops();
    let before = health.keys();

    topo.fail_resolve.store(true, Ordering::SeqCst);
    topo.store().delete_node_record(&survivor.alias).unwrap();
    let err = watcher.load_tablets().await.unwrap_err();

    assert!(matches!(err, DiscoveryError::Resolve(TopoError::Unavailable(_))));
    assert!(health.take_ops().is_empty());
    assert_eq!(health.keys(), before);
    assert_eq!(watcher.stats().resolve_errors, 1);

    // The retained snapshot is still authoritative once the service recovers.
    topo.fail_resolve.store(false, Ordering::SeqCst);
    watcher.load_tablets().await.unwrap();
    assert_eq!(health.take_ops(), vec![Op::Remove(endpoint_key(&survivor))]);
}

#[tokio::test]
async fn missing_shard_graph_is_a_resolve_failure() {
    let (topo, health) = fixture();
    let watcher = TopologyWatcher::new_shard_replication_watcher(
        topo.clone(),
        health.clone(),
        "aa",
        "ks",
        "0",
        LONG_INTERVAL,
        5,
    )
    .unwrap();

    let err = watcher.load_tablets().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Resolve(TopoError::NotFound(_))));
    assert!(health.take_ops().is_empty());
}

#[tokio::test]
async fn fetch_failure_drops_alias_until_it_recovers() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);
    let healthy = add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);
    let flaky = add_tablet(topo.store(), "aa", 1, "h1", &[("vt", 1)]);
    watcher.load_tablets().await.unwrap();
    health.take_ops();

    topo.fail_fetch(&flaky.alias);
    let report = watcher.load_tablets().await.unwrap();

    assert_eq!(report.fetch_errors, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(health.take_ops(), vec![Op::Remove(endpoint_key(&flaky))]);
    assert_eq!(health.keys(), vec![endpoint_key(&healthy)]);

    topo.heal_fetches();
    let report = watcher.load_tablets().await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(health.take_ops(), vec![Op::Add(endpoint_key(&flaky))]);
    assert_eq!(watcher.stats().fetch_errors, 1);
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_fan_out_respects_concurrency_limit() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 3);
    for uid in 0..20 {
        add_tablet(topo.store(), "aa", uid, &format!("host{uid}"), &[("vt", 1)]);
    }
    topo.set_fetch_delay(Duration::from_millis(20));

    let report = watcher.load_tablets().await.unwrap();

    assert_eq!(report.added, 20);
    assert_eq!(topo.fetches.load(Ordering::SeqCst), 20);
    let peak = topo.max_in_flight.load(Ordering::SeqCst);
    // Exactly the limit: bounded, but still running in parallel.
    assert_eq!(peak, 3, "peak in-flight fetches was {peak}");
}

#[tokio::test]
async fn watchers_sharing_a_registry_are_independent() {
    let (topo, health) = fixture();
    let aa = cell_watcher(&topo, &health, LONG_INTERVAL, 2);
    let bb = TopologyWatcher::new_cell_watcher(topo.clone(), health.clone(), "bb", LONG_INTERVAL, 2)
        .unwrap();
    let in_aa = add_tablet(topo.store(), "aa", 0, "h", &[("vt", 1)]);
    let in_bb = add_tablet(topo.store(), "bb", 0, "h", &[("vt", 1)]);

    let (ra, rb) = tokio::join!(aa.load_tablets(), bb.load_tablets());
    assert_eq!(ra.unwrap().added, 1);
    assert_eq!(rb.unwrap().added, 1);
    assert_eq!(health.registry.len(), 2);

    topo.store().delete_node_record(&in_aa.alias).unwrap();
    aa.load_tablets().await.unwrap();
    assert_eq!(health.keys(), vec![endpoint_key(&in_bb)]);
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn loop_runs_immediately_then_on_interval() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, Duration::from_secs(10), 5);
    add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);

    watcher.start().await.unwrap();
    assert_eq!(watcher.state(), WatcherState::Running);
    watcher.wait_for_initial_load().await;
    assert_eq!(health.registry.len(), 1);

    add_tablet(topo.store(), "aa", 1, "h1", &[("vt", 1)]);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(health.registry.len(), 2);
    assert_eq!(watcher.stats().cycles, 2);

    watcher.stop().await;
    assert_eq!(watcher.state(), WatcherState::Stopped);

    // No ticks after stop.
    add_tablet(topo.store(), "aa", 2, "h2", &[("vt", 1)]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(health.registry.len(), 2);
    assert_eq!(watcher.stats().cycles, 2);
}

#[tokio::test(start_paused = true)]
async fn resolve_failures_are_retried_on_the_next_tick() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, Duration::from_secs(5), 5);
    add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);
    topo.fail_resolve.store(true, Ordering::SeqCst);

    watcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(watcher.stats().resolve_errors, 1);
    assert!(health.registry.is_empty());

    topo.fail_resolve.store(false, Ordering::SeqCst);
    watcher.wait_for_initial_load().await;
    assert_eq!(health.registry.len(), 1);

    watcher.stop().await;
}

#[tokio::test]
async fn stop_abandons_in_flight_fetches() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 2);
    add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);
    topo.hold.store(true, Ordering::SeqCst);

    watcher.start().await.unwrap();
    topo.entered.notified().await;
    watcher.stop().await;

    assert_eq!(watcher.state(), WatcherState::Stopped);
    assert!(health.take_ops().is_empty());
    assert_eq!(watcher.stats().cycles, 0);

    // Aborted fetch tasks are torn down by the runtime shortly after.
    for _ in 0..100 {
        if topo.in_flight() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(topo.in_flight(), 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);

    // Never started.
    watcher.stop().await;
    assert_eq!(watcher.state(), WatcherState::Stopped);

    watcher.start().await.unwrap();
    watcher.wait_for_initial_load().await;
    watcher.stop().await;
    watcher.stop().await;
    assert_eq!(watcher.state(), WatcherState::Stopped);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, LONG_INTERVAL, 5);

    watcher.start().await.unwrap();
    let err = watcher.start().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::AlreadyRunning(_)));

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restart_keeps_the_snapshot() {
    let (topo, health) = fixture();
    let watcher = cell_watcher(&topo, &health, Duration::from_secs(30), 5);
    add_tablet(topo.store(), "aa", 0, "h0", &[("vt", 1)]);

    watcher.start().await.unwrap();
    watcher.wait_for_initial_load().await;
    watcher.stop().await;
    assert_eq!(health.take_ops().len(), 1);

    watcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    watcher.stop().await;

    assert_eq!(watcher.stats().cycles, 2);
    assert!(health.take_ops().is_empty());
}

#[tokio::test]
async fn invalid_construction_is_rejected() {
    let (topo, health) = fixture();

    let err = TopologyWatcher::new_cell_watcher(topo.clone(), health.clone(), "", LONG_INTERVAL, 5)
        .err()
        .unwrap();
    assert!(matches!(err, DiscoveryError::InvalidConfig(_)));

    let err = TopologyWatcher::new_cell_watcher(topo.clone(), health.clone(), "aa", LONG_INTERVAL, 0)
        .err()
        .unwrap();
    assert!(matches!(err, DiscoveryError::InvalidConfig(_)));

    let err = TopologyWatcher::new_shard_replication_watcher(
        topo.clone(),
        health.clone(),
        "aa",
        "ks",
        "0",
        Duration::ZERO,
        5,
    )
    .err()
    .unwrap();
    assert!(matches!(err, DiscoveryError::InvalidConfig(_)));
}
