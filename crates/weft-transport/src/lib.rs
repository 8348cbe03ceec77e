//! Weft transport layer.
//!
//! A uniform driver contract ([`TransportDriver`]) implemented by each
//! concrete transport: same-host/LAN UDP multicast ([`LanDriver`]),
//! P2P-over-internet bootstrapped by signaling blobs ([`P2pDriver`]),
//! and the rendezvous relay client (lives in `weft-relay`).
//!
//! Drivers never interpret packet contents — every payload is an
//! opaque byte sequence. Peer observations, inbound bytes, and
//! availability changes all funnel into a single [`DriverEvent`]
//! channel owned by the protocol runtime.

pub mod driver;
pub mod error;
pub mod lan;
pub mod p2p;
pub mod queue;
pub mod testing;
pub mod types;

pub use driver::{DriverEvent, TransportDriver};
pub use error::TransportError;
pub use lan::LanDriver;
pub use p2p::P2pDriver;
pub use types::{NodeId, PeerDescriptor, SignalBlob, TransportKind};
