//! Per-watcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a watcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Cycles that resolved their scope and applied a diff.
    pub cycles: u64,
    /// Cycles aborted because the scope could not be resolved.
    pub resolve_errors: u64,
    /// Individual node records that could not be fetched.
    pub fetch_errors: u64,
    pub adds: u64,
    pub removes: u64,
    /// Aliases whose endpoint key changed (one remove plus one add each).
    pub replaces: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    cycles: AtomicU64,
    resolve_errors: AtomicU64,
    fetch_errors: AtomicU64,
    adds: AtomicU64,
    removes: AtomicU64,
    replaces: AtomicU64,
}

impl Counters {
    pub(crate) fn record_resolve_error(&self) {
        self.resolve_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self, adds: u64, removes: u64, replaces: u64, fetch_errors: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.adds.fetch_add(adds, Ordering::Relaxed);
        self.removes.fetch_add(removes, Ordering::Relaxed);
        self.replaces.fetch_add(replaces, Ordering::Relaxed);
        self.fetch_errors.fetch_add(fetch_errors, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WatcherStats {
        WatcherStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            resolve_errors: self.resolve_errors.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            adds: self.adds.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            replaces: self.replaces.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = Counters::default();
        counters.record_cycle(2, 0, 0, 1);
        counters.record_cycle(0, 1, 1, 0);
        counters.record_resolve_error();

        assert_eq!(
            counters.snapshot(),
            WatcherStats {
                cycles: 2,
                resolve_errors: 1,
                fetch_errors: 1,
                adds: 2,
                removes: 1,
                replaces: 1,
            }
        );
    }
}
