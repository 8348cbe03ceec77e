use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Characters used when generating a fresh node identifier.
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated node identifier.
const ID_LEN: usize = 8;

/// Broadcast target accepted by every node.
const WILDCARD: &str = "*";

/// Node identity — 8 uppercase alphanumeric characters, generated at
/// first run and persisted across restarts.
///
/// The identifier is opaque: equality is exact byte match, and ids
/// received from the wire are never normalized. The wildcard id `*`
/// addresses every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Generate an identifier from a caller-supplied RNG (deterministic tests).
    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let id: String = (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        NodeId(id)
    }

    /// The wildcard id addressing every node.
    pub fn wildcard() -> Self {
        NodeId(WILDCARD.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = TransportError;

    /// Accepts any non-empty id up to 64 bytes. Remote ids are opaque;
    /// only locally generated ids follow the 8-char uppercase form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 64 || s.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(TransportError::InvalidNodeId(s.to_string()));
        }
        Ok(NodeId(s.to_string()))
    }
}

/// A concrete transport flavor.
///
/// `Ble` and `WifiDirect` are the optional native OS transports; they
/// share the driver contract but no in-tree driver is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Lan,
    P2p,
    Relay,
    Ble,
    WifiDirect,
}

impl TransportKind {
    /// Static preference bias added to the selector score.
    pub fn bias(&self) -> i64 {
        match self {
            TransportKind::P2p => 20,
            TransportKind::Lan => 15,
            TransportKind::Ble | TransportKind::WifiDirect => 10,
            TransportKind::Relay => 5,
        }
    }

    /// Whether observations on this transport come from the local
    /// vicinity (shorter liveness timeouts) rather than the internet.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TransportKind::Lan | TransportKind::Ble | TransportKind::WifiDirect
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Lan => "lan",
            TransportKind::P2p => "p2p",
            TransportKind::Relay => "relay",
            TransportKind::Ble => "ble",
            TransportKind::WifiDirect => "wifi_direct",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan" => Ok(TransportKind::Lan),
            "p2p" => Ok(TransportKind::P2p),
            "relay" => Ok(TransportKind::Relay),
            "ble" => Ok(TransportKind::Ble),
            "wifi_direct" => Ok(TransportKind::WifiDirect),
            other => Err(TransportError::InvalidTransportKind(other.to_string())),
        }
    }
}

/// What a driver knows about a peer it can currently reach.
///
/// Name and device type are best-effort — drivers that learn them from
/// their own beacons fill them in, others leave `None` and the peer
/// registry falls back to the packet-level self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// 0–100, driver heuristic (e.g. derived from RSSI or RTT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<u8>,
}

impl PeerDescriptor {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            name: None,
            device_type: None,
            signal_strength: None,
        }
    }
}

/// Signaling blob exchanged through the rendezvous channel to
/// bootstrap a direct P2P connection.
///
/// Deliberately small: the advertised socket addresses are the only
/// traversal input the core supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBlob {
    pub node_id: NodeId,
    /// Candidate `ip:port` endpoints, most preferred first.
    pub addrs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn generated_id_shape() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let id = NodeId::generate_with(&mut rng);
        assert_eq!(id.as_str().len(), 8);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let mut a = rand::rngs::StdRng::seed_from_u64(42);
        let mut b = rand::rngs::StdRng::seed_from_u64(42);
        assert_eq!(NodeId::generate_with(&mut a), NodeId::generate_with(&mut b));
    }

    #[test]
    fn wildcard() {
        let w = NodeId::wildcard();
        assert!(w.is_wildcard());
        assert_eq!(w.as_str(), "*");
        assert!(!NodeId::generate().is_wildcard());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<NodeId>().is_err());
        assert!("has space".parse::<NodeId>().is_err());
        assert!("with\nnewline".parse::<NodeId>().is_err());
        assert!("ABCD1234".parse::<NodeId>().is_ok());
        assert!("*".parse::<NodeId>().is_ok());
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let id: NodeId = "ABCD1234".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ABCD1234\"");
    }

    #[test]
    fn kind_roundtrip() {
        for kind in [
            TransportKind::Lan,
            TransportKind::P2p,
            TransportKind::Relay,
            TransportKind::Ble,
            TransportKind::WifiDirect,
        ] {
            let parsed: TransportKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn bias_ordering_prefers_direct_transports() {
        assert!(TransportKind::P2p.bias() > TransportKind::Lan.bias());
        assert!(TransportKind::Lan.bias() > TransportKind::Ble.bias());
        assert!(TransportKind::Ble.bias() > TransportKind::Relay.bias());
    }
}
