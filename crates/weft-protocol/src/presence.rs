//! Presence and discovery state: the self-description document carried
//! by ANNOUNCE/DISCOVER payloads, the responsive-announce bookkeeping,
//! and the scanning burst counter. Periodic timing lives in the
//! runtime loop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceType, NodeId};

/// What a node says about itself in ANNOUNCE/DISCOVER payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub brand_hint: String,
    pub os_hint: String,
}

impl SelfDescription {
    pub fn new(name: String, device_type: DeviceType, brand_hint: String) -> Self {
        Self {
            name,
            device_type,
            brand_hint,
            os_hint: std::env::consts::OS.to_string(),
        }
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("self description serialization cannot fail")
    }

    /// Best-effort parse; presence payloads from unknown versions are
    /// not worth dropping a packet over.
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Presence-side state: who we have already greeted, and the scan burst.
pub struct Presence {
    description: SelfDescription,
    greeted: HashSet<NodeId>,
    scanning: bool,
    scan_remaining: u32,
}

impl Presence {
    pub fn new(description: SelfDescription) -> Self {
        Self {
            description,
            greeted: HashSet::new(),
            scanning: false,
            scan_remaining: 0,
        }
    }

    pub fn description(&self) -> &SelfDescription {
        &self.description
    }

    pub fn set_name(&mut self, name: String) {
        self.description.name = name;
    }

    /// First ANNOUNCE/DISCOVER from this peer? `true` means a one-shot
    /// responsive ANNOUNCE is owed (never twice, so not recursive).
    pub fn first_contact(&mut self, peer: &NodeId) -> bool {
        self.greeted.insert(peer.clone())
    }

    /// Enter scanning mode with a DISCOVER burst. Returns `false` if a
    /// scan is already running.
    pub fn start_scan(&mut self, burst: u32) -> bool {
        if self.scanning {
            return false;
        }
        self.scanning = true;
        self.scan_remaining = burst;
        true
    }

    pub fn stop_scan(&mut self) -> bool {
        let was = self.scanning;
        self.scanning = false;
        self.scan_remaining = 0;
        was
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// One scan tick: `true` when a DISCOVER should go out. The scan
    /// ends by itself when the burst is spent.
    pub fn tick_scan(&mut self) -> bool {
        if !self.scanning {
            return false;
        }
        if self.scan_remaining == 0 {
            self.scanning = false;
            return false;
        }
        self.scan_remaining -= 1;
        true
    }
}
