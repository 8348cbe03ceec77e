//! Transport selector: scores the available transports for a peer and
//! produces an ordered attempt list with graceful fallback.
//!
//! Pure logic over the metrics table. `record_success` and
//! `record_failure` are the only mutation paths for reliability.

use std::collections::HashMap;

use crate::types::TransportKind;

/// Fallbacks returned after the primary.
const MAX_FALLBACKS: usize = 2;

/// Reliability a transport starts at before any evidence.
const INITIAL_RELIABILITY: u8 = 50;

/// Live metrics for one transport.
#[derive(Debug, Clone)]
pub struct TransportMetrics {
    pub available: bool,
    pub enabled: bool,
    /// Peers currently connected through this transport.
    pub device_count: u32,
    /// Rough RTT estimate in ms.
    pub latency_hint: u32,
    /// 0–100; +5 per success, −10 per failure.
    pub reliability: u8,
    /// Unix ms of the last successful send.
    pub last_success: Option<u64>,
    pub failure_count: u32,
}

impl TransportMetrics {
    fn new() -> Self {
        Self {
            available: false,
            enabled: true,
            device_count: 0,
            latency_hint: 100,
            reliability: INITIAL_RELIABILITY,
            last_success: None,
            failure_count: 0,
        }
    }
}

/// Scores transports per peer and orders the attempts.
pub struct TransportSelector {
    metrics: HashMap<TransportKind, TransportMetrics>,
}

impl TransportSelector {
    pub fn new() -> Self {
        Self {
            metrics: HashMap::new(),
        }
    }

    /// Register a transport the node carries. Unregistered kinds never
    /// appear in attempt lists.
    pub fn register(&mut self, kind: TransportKind) {
        self.metrics.entry(kind).or_insert_with(TransportMetrics::new);
    }

    pub fn set_available(&mut self, kind: TransportKind, available: bool) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.available = available;
        }
    }

    pub fn set_enabled(&mut self, kind: TransportKind, enabled: bool) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.enabled = enabled;
        }
    }

    pub fn set_device_count(&mut self, kind: TransportKind, count: u32) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.device_count = count;
        }
    }

    pub fn set_latency_hint(&mut self, kind: TransportKind, latency_ms: u32) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.latency_hint = latency_ms;
        }
    }

    /// A send on `kind` worked: reliability +5 (capped), failure streak
    /// cleared.
    pub fn record_success(&mut self, kind: TransportKind, now: u64) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.reliability = m.reliability.saturating_add(5).min(100);
            m.last_success = Some(now);
            m.failure_count = 0;
        }
    }

    /// A send on `kind` failed: reliability −10 (floored).
    pub fn record_failure(&mut self, kind: TransportKind) {
        if let Some(m) = self.metrics.get_mut(&kind) {
            m.reliability = m.reliability.saturating_sub(10);
            m.failure_count = m.failure_count.saturating_add(1);
        }
    }

    pub fn metrics(&self, kind: TransportKind) -> Option<&TransportMetrics> {
        self.metrics.get(&kind)
    }

    /// Any transport currently usable at all.
    pub fn any_available(&self) -> bool {
        self.metrics.values().any(|m| m.available && m.enabled)
    }

    /// Transports currently available, unordered.
    pub fn available_transports(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<TransportKind> = self
            .metrics
            .iter()
            .filter(|(_, m)| m.available && m.enabled)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort_by_key(|k| std::cmp::Reverse(k.bias()));
        kinds
    }

    /// Ordered attempt list for reaching `peer`: primary plus up to
    /// two fallbacks. `peer_supports` reports whether the peer has
    /// been observed on a transport.
    pub fn attempt_order<F>(&self, peer_supports: F, now: u64) -> Vec<TransportKind>
    where
        F: Fn(TransportKind) -> bool,
    {
        let mut scored: Vec<(i64, TransportKind)> = self
            .metrics
            .iter()
            .filter(|(_, m)| m.available && m.enabled)
            .map(|(kind, m)| (score(*kind, m, peer_supports(*kind), now), *kind))
            .collect();
        // Descending score; bias breaks exact ties deterministically.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.bias().cmp(&a.1.bias())));
        scored
            .into_iter()
            .take(1 + MAX_FALLBACKS)
            .map(|(_, kind)| kind)
            .collect()
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn score(kind: TransportKind, m: &TransportMetrics, peer_supports: bool, now: u64) -> i64 {
    let mut score = m.reliability as i64;
    score += (50 - (m.latency_hint as i64) / 10).max(0);
    if peer_supports {
        score += 50;
    }
    if let Some(last) = m.last_success {
        let since = now.saturating_sub(last);
        if since < 60_000 {
            score += 30;
        }
        if since < 300_000 {
            score += 15;
        }
    }
    score -= 10 * m.failure_count as i64;
    score += (2 * m.device_count as i64).min(20);
    score += kind.bias();
    score
}
