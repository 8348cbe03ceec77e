//! Runtime configuration. All knobs have the defaults the protocol is
//! specified with; the builder methods cover the ones applications and
//! tests actually change.

use crate::packet::{DEFAULT_TTL, MAX_PACKET_SIZE};
use crate::types::DeviceType;

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Display name; defaults to `MeshUser-<id>` on first run.
    pub device_name: Option<String>,
    pub device_type: DeviceType,
    /// Free-form vendor hint included in the self-description.
    pub brand_hint: String,

    // ── Packet protocol ──────────────────────────────────────────────
    pub max_ttl: u8,
    pub max_packet_size: usize,
    pub seen_set_high: usize,
    pub seen_set_low: usize,

    // ── Presence ─────────────────────────────────────────────────────
    pub announce_period_ms: u64,
    pub scan_announce_burst: u32,
    pub soft_peer_timeout_ms: u64,
    pub hard_peer_timeout_ms: u64,
    pub sweep_period_ms: u64,

    // ── Delivery / retry ─────────────────────────────────────────────
    pub retry_base_ms: u64,
    pub retry_factor: f64,
    pub retry_cap_ms: u64,
    pub max_retries: u32,
    pub reconnect_drain_floor_ms: u64,
    /// Cadence of the retry scheduler's due-check.
    pub retry_tick_ms: u64,

    // ── Rendezvous sync ──────────────────────────────────────────────
    pub relay_sync_period_ms: u64,

    // ── Storage hygiene ──────────────────────────────────────────────
    /// Devices unseen for this long are evicted from the store.
    pub device_evict_age_ms: u64,

    // ── Drivers ──────────────────────────────────────────────────────
    /// UDP multicast port for the LAN driver.
    pub lan_port: u16,
    /// Listen port for the P2P driver; 0 for ephemeral.
    pub p2p_port: u16,
    /// Extra endpoints to advertise in P2P signaling blobs.
    pub p2p_advertise: Vec<String>,
    /// Rendezvous relay address; `None` disables the relay driver.
    pub relay_addr: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            device_type: DeviceType::Unknown,
            brand_hint: "weft".into(),
            max_ttl: DEFAULT_TTL,
            max_packet_size: MAX_PACKET_SIZE,
            seen_set_high: 2000,
            seen_set_low: 1000,
            announce_period_ms: 3000,
            scan_announce_burst: 5,
            soft_peer_timeout_ms: 15_000,
            hard_peer_timeout_ms: 45_000,
            sweep_period_ms: 5000,
            retry_base_ms: 2000,
            retry_factor: 1.5,
            retry_cap_ms: 60_000,
            max_retries: 20,
            reconnect_drain_floor_ms: 10_000,
            retry_tick_ms: 500,
            relay_sync_period_ms: 30_000,
            device_evict_age_ms: 7 * 24 * 60 * 60 * 1000,
            lan_port: 47_701,
            p2p_port: 0,
            p2p_advertise: Vec::new(),
            relay_addr: None,
        }
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_name(mut self, name: &str) -> Self {
        self.device_name = Some(name.to_string());
        self
    }

    pub fn device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn relay_addr(mut self, addr: &str) -> Self {
        self.relay_addr = Some(addr.to_string());
        self
    }

    pub fn lan_port(mut self, port: u16) -> Self {
        self.lan_port = port;
        self
    }

    pub fn max_ttl(mut self, ttl: u8) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Shrink the retry schedule (tests that exercise exhaustion).
    pub fn retry_schedule(mut self, base_ms: u64, cap_ms: u64, max_retries: u32) -> Self {
        self.retry_base_ms = base_ms;
        self.retry_cap_ms = cap_ms;
        self.max_retries = max_retries;
        self
    }
}
