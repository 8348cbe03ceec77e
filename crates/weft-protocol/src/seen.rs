//! Duplicate suppression: a bounded set of recently observed packet
//! ids. Insertion order is kept so compaction can retain the most
//! recent half when the high watermark is crossed.

use std::collections::{HashSet, VecDeque};

/// Bounded set of packet ids for duplicate suppression.
pub struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    high: usize,
    low: usize,
}

impl SeenSet {
    /// `high` triggers compaction; `low` is the size kept afterwards.
    pub fn new(high: usize, low: usize) -> Self {
        debug_assert!(low <= high && low > 0);
        Self {
            ids: HashSet::with_capacity(high + 1),
            order: VecDeque::with_capacity(high + 1),
            high,
            low,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Insert an id. Returns `false` if it was already present.
    /// Compacts to the low watermark when the high watermark is crossed.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.high {
            self.compact();
        }
        true
    }

    /// Drop the oldest entries, keeping the most recent `low`.
    pub fn compact(&mut self) {
        while self.order.len() > self.low {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
