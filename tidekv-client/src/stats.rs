//! # Pool Statistics
//!
//! Purpose: Cheap, always-on counters for pool observability: idle-set hits
//! and misses, admission timeouts, and stale evictions.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events without
//!    touching the pool mutex on the hot path.
//! 2. **Relaxed Ordering**: Counters need no cross-field ordering, only
//!    eventual consistency, so `Ordering::Relaxed` is sufficient.
//! 3. **Plain Snapshots**: Readers get a copyable struct; snapshotting never
//!    blocks a `get`/`put`/`remove` caller.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of pool counters and gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Checkouts served from the idle set.
    pub hits: u64,
    /// Checkouts that required a fresh dial.
    pub misses: u64,
    /// `get` calls that gave up waiting for admission.
    pub timeouts: u64,
    /// Connections destroyed for exceeding age or idle thresholds.
    pub stale_conns: u64,
    /// Live connections, idle plus checked out.
    pub total_conns: usize,
    /// Connections currently in the idle set.
    pub idle_conns: usize,
}

pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        StatsCounters {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            stale_conns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self, count: u64) {
        self.stale_conns.fetch_add(count, Ordering::Relaxed);
    }

    /// Combines the atomic counters with gauges read by the caller.
    pub(crate) fn snapshot(&self, total_conns: usize, idle_conns: usize) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
            total_conns,
            idle_conns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = StatsCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_timeout();
        counters.record_stale(3);

        let snapshot = counters.snapshot(4, 2);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.stale_conns, 3);
        assert_eq!(snapshot.total_conns, 4);
        assert_eq!(snapshot.idle_conns, 2);
    }
}
