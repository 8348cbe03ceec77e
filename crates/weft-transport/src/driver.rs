use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{NodeId, PeerDescriptor, SignalBlob, TransportKind};

/// Event a driver pushes into the runtime.
///
/// All drivers share one `mpsc::Sender<DriverEvent>`; the runtime is
/// the single consumer. Drivers only report — they never act on what
/// they carry.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A peer became reachable on this transport (or refreshed its
    /// driver-level beacon).
    PeerObserved {
        transport: TransportKind,
        peer: PeerDescriptor,
    },
    /// A peer stopped answering on this transport.
    PeerLost {
        transport: TransportKind,
        peer_id: NodeId,
    },
    /// Opaque inbound payload from a peer.
    Bytes {
        transport: TransportKind,
        from: NodeId,
        bytes: Vec<u8>,
    },
    /// The driver as a whole came up or went down.
    AvailableChanged {
        transport: TransportKind,
        available: bool,
    },
    /// A queued or in-flight send was dropped. The selector devalues
    /// the transport on this signal.
    SendFailed {
        transport: TransportKind,
        peer_id: Option<NodeId>,
    },
    /// A signaling blob arrived through a rendezvous channel,
    /// addressed to us. The runtime hands it to the P2P driver.
    Signal { from: NodeId, blob: SignalBlob },
}

/// Uniform contract every concrete transport implements.
///
/// Payloads are opaque byte sequences — a driver must not parse them.
/// Each driver bounds its own send queue and drops the oldest entry on
/// overflow, reporting [`DriverEvent::SendFailed`] so the selector can
/// devalue the transport.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bring the driver up. Emits `AvailableChanged(true)` once ready.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the driver down, cancelling its tasks. Emits
    /// `AvailableChanged(false)`.
    async fn stop(&self);

    /// Best-effort fan-out to all currently reachable peers.
    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Send to one peer. Fails if the peer is unknown to this driver.
    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Peers with an active channel on this transport right now.
    async fn connected_peers(&self) -> Vec<NodeId>;

    fn is_available(&self) -> bool;
}
