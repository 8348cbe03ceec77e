//! Diagnostic counters for the routing engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter backed by an [`AtomicU64`]. Relaxed ordering —
/// these feed diagnostics, not control flow.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Per-router drop/forward counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub dropped_bad_digest: Counter,
    pub dropped_duplicate: Counter,
    pub dropped_oversize: Counter,
    pub dropped_malformed: Counter,
    pub delivered: Counter,
    pub relayed: Counter,
    pub acked: Counter,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            dropped_bad_digest: self.dropped_bad_digest.get(),
            dropped_duplicate: self.dropped_duplicate.get(),
            dropped_oversize: self.dropped_oversize.get(),
            dropped_malformed: self.dropped_malformed.get(),
            delivered: self.delivered.get(),
            relayed: self.relayed.get(),
            acked: self.acked.get(),
        }
    }
}

/// Point-in-time copy of [`RouterStats`], serializable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub dropped_bad_digest: u64,
    pub dropped_duplicate: u64,
    pub dropped_oversize: u64,
    pub dropped_malformed: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub acked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_counts() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn snapshot_copies_values() {
        let stats = RouterStats::default();
        stats.delivered.inc();
        stats.dropped_duplicate.inc();
        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.dropped_duplicate, 1);
        assert_eq!(snap.relayed, 0);
    }
}
