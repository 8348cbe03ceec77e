//! Peer registry: the merged device view across all transports.
//!
//! Pure state machine — observations go in, registry events come out.
//! The periodic sweep applies the two-tier liveness timeouts: soft
//! (disconnect) and hard (lost, record retained). Deletion is the
//! storage layer's job, not the registry's.

use std::collections::{HashMap, HashSet};

use crate::types::{DeviceRecord, DeviceType, NodeId, TransportKind};

/// Default multiplier from the soft timeout to the hard (lost) one.
pub const DEFAULT_HARD_TIMEOUT_FACTOR: u64 = 3;

/// A single peer observation, however it arrived (driver beacon,
/// ANNOUNCE/DISCOVER payload, relay device table).
#[derive(Debug, Clone)]
pub struct PeerObservation {
    pub id: NodeId,
    pub name: Option<String>,
    pub device_type: Option<DeviceType>,
    pub signal_strength: Option<u8>,
}

impl PeerObservation {
    pub fn bare(id: NodeId) -> Self {
        Self {
            id,
            name: None,
            device_type: None,
            signal_strength: None,
        }
    }
}

/// What changed in the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Discovered(DeviceRecord),
    Updated(DeviceRecord),
    Lost(NodeId),
}

struct PeerEntry {
    record: DeviceRecord,
    /// Transports that have ever observed this peer (selector input).
    transports: HashSet<TransportKind>,
    /// Transports currently reporting an active channel.
    connected_on: HashSet<TransportKind>,
    lost_emitted: bool,
}

/// Names a transport invents when it has nothing better. They never
/// override a concrete name learned elsewhere.
fn is_generic_name(name: &str) -> bool {
    name.starts_with("MeshUser-") || name.starts_with("Device-")
}

/// Merged view of all remote devices.
pub struct PeerRegistry {
    local_id: NodeId,
    peers: HashMap<NodeId, PeerEntry>,
    soft_timeout_local_ms: u64,
    soft_timeout_remote_ms: u64,
    hard_timeout_factor: u64,
}

impl PeerRegistry {
    pub fn new(local_id: NodeId, soft_timeout_local_ms: u64, soft_timeout_remote_ms: u64) -> Self {
        Self::with_hard_factor(
            local_id,
            soft_timeout_local_ms,
            soft_timeout_remote_ms,
            DEFAULT_HARD_TIMEOUT_FACTOR,
        )
    }

    /// `hard_timeout_factor` scales each tier's soft timeout up to the
    /// lost threshold.
    pub fn with_hard_factor(
        local_id: NodeId,
        soft_timeout_local_ms: u64,
        soft_timeout_remote_ms: u64,
        hard_timeout_factor: u64,
    ) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            soft_timeout_local_ms,
            soft_timeout_remote_ms,
            hard_timeout_factor: hard_timeout_factor.max(1),
        }
    }

    /// Merge an observation. Returns the resulting event, or `None`
    /// for observations of ourselves.
    pub fn observe(
        &mut self,
        observation: PeerObservation,
        transport: TransportKind,
        now: u64,
    ) -> Option<RegistryEvent> {
        if observation.id == self.local_id {
            return None;
        }

        match self.peers.get_mut(&observation.id) {
            None => {
                let mut record = DeviceRecord::observed(observation.id.clone(), transport, now);
                if let Some(name) = observation.name.filter(|n| !is_generic_name(n)) {
                    record.name = name;
                }
                if let Some(device_type) = observation.device_type {
                    record.device_type = device_type;
                }
                if let Some(signal) = observation.signal_strength {
                    record.signal_strength = signal.min(100);
                }
                let entry = PeerEntry {
                    record: record.clone(),
                    transports: HashSet::from([transport]),
                    connected_on: HashSet::from([transport]),
                    lost_emitted: false,
                };
                self.peers.insert(observation.id, entry);
                Some(RegistryEvent::Discovered(record))
            }
            Some(entry) => {
                let record = &mut entry.record;
                if let Some(signal) = observation.signal_strength {
                    record.signal_strength = record.signal_strength.max(signal.min(100));
                }
                record.is_connected = true;
                record.is_online = true;
                record.last_seen = now;
                record.connection_type = transport;
                if let Some(name) = observation.name.filter(|n| !is_generic_name(n)) {
                    record.name = name;
                }
                if let Some(device_type) = observation.device_type {
                    if device_type != DeviceType::Unknown {
                        record.device_type = device_type;
                    }
                }
                entry.transports.insert(transport);
                entry.connected_on.insert(transport);
                entry.lost_emitted = false;
                Some(RegistryEvent::Updated(record.clone()))
            }
        }
    }

    /// PING ingress: refresh liveness without a full observation.
    pub fn refresh(&mut self, id: &NodeId, now: u64) -> Option<RegistryEvent> {
        let entry = self.peers.get_mut(id)?;
        entry.record.last_seen = now;
        entry.record.is_online = true;
        entry.lost_emitted = false;
        Some(RegistryEvent::Updated(entry.record.clone()))
    }

    /// Typing indicator received from a peer.
    pub fn set_typing(&mut self, id: &NodeId, is_typing: bool, now: u64) -> Option<RegistryEvent> {
        let entry = self.peers.get_mut(id)?;
        entry.record.last_seen = now;
        if entry.record.is_typing == is_typing {
            return None;
        }
        entry.record.is_typing = is_typing;
        Some(RegistryEvent::Updated(entry.record.clone()))
    }

    /// A driver lost its channel to the peer. Connection state drops
    /// only when no transport still holds one.
    pub fn transport_lost(&mut self, id: &NodeId, transport: TransportKind) -> Option<RegistryEvent> {
        let entry = self.peers.get_mut(id)?;
        entry.connected_on.remove(&transport);
        if entry.connected_on.is_empty() && entry.record.is_connected {
            entry.record.is_connected = false;
            return Some(RegistryEvent::Updated(entry.record.clone()));
        }
        None
    }

    /// The periodic liveness sweep. Soft timeout flips `is_connected`;
    /// the hard timeout (3× soft) emits `Lost` but RETAINS the record
    /// with `is_online = false`.
    pub fn sweep(&mut self, now: u64) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        for entry in self.peers.values_mut() {
            let soft = if entry.record.connection_type.is_local() {
                self.soft_timeout_local_ms
            } else {
                self.soft_timeout_remote_ms
            };
            let silent_for = now.saturating_sub(entry.record.last_seen);

            if silent_for > soft * self.hard_timeout_factor {
                if !entry.lost_emitted {
                    entry.record.is_connected = false;
                    entry.record.is_online = false;
                    entry.record.is_typing = false;
                    entry.connected_on.clear();
                    entry.lost_emitted = true;
                    events.push(RegistryEvent::Lost(entry.record.id.clone()));
                }
            } else if silent_for > soft && entry.record.is_connected {
                entry.record.is_connected = false;
                entry.connected_on.clear();
                events.push(RegistryEvent::Updated(entry.record.clone()));
            }
        }
        events
    }

    pub fn device(&self, id: &NodeId) -> Option<&DeviceRecord> {
        self.peers.get(id).map(|e| &e.record)
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.peers.values().map(|e| e.record.clone()).collect()
    }

    /// Whether `peer` has ever been observed on `transport`.
    pub fn peer_supports(&self, id: &NodeId, transport: TransportKind) -> bool {
        self.peers
            .get(id)
            .is_some_and(|e| e.transports.contains(&transport))
    }

    /// Peers currently connected through `transport`.
    pub fn connected_count_on(&self, transport: TransportKind) -> u32 {
        self.peers
            .values()
            .filter(|e| e.connected_on.contains(&transport))
            .count() as u32
    }

    pub fn is_known(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
