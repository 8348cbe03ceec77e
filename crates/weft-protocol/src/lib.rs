//! Weft mesh routing and delivery engine.
//!
//! Implements the packet protocol, the per-node routing/relay state
//! machine, the multi-transport selector, the at-least-once delivery
//! pipeline with ACKs and retries, presence/discovery, and the
//! store-and-forward sync against the rendezvous relay.
//!
//! Wire format: UTF-8 JSON, camelCase fields, 32-bit rolling-hash
//! integrity digest (bit-exact across implementations).
//!
//! Architecture: pure decision modules ([`router`], [`registry`],
//! [`selector`], [`pending`], [`presence`]) driven by a thin tokio
//! event loop in [`runtime`]; the executor there is the only place
//! that performs I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod packet;
pub mod pending;
pub mod presence;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod seen;
pub mod selector;
pub mod types;

pub use config::MeshConfig;
pub use error::WeftError;
pub use packet::{content_digest, Packet, PacketType};
pub use registry::{PeerObservation, PeerRegistry, RegistryEvent};
pub use router::{Router, RouterAction};
pub use runtime::{DriverSet, MeshChannels, MeshEvent, MeshHandle, MeshNode};
pub use seen::SeenSet;
pub use selector::{TransportMetrics, TransportSelector};
pub use types::{
    conversation_key, DeviceRecord, DeviceType, Message, MessageStatus, NodeId, TransportKind,
};
