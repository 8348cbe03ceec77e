//! Rendezvous relay for the Weft mesh.
//!
//! A network-backed fallback channel with three jobs: device discovery
//! when no direct transport sees a peer, signaling-blob exchange to
//! bootstrap P2P links, and store-and-forward for messages addressed
//! to peers that are currently offline.
//!
//! The wire protocol is newline-delimited JSON over TCP ([`wire`]).
//! [`RelayServer`] is the service side; [`RelayDriver`] is the client,
//! implementing the standard transport driver contract plus the
//! record-store operations the protocol runtime uses for sync.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::RelayDriver;
pub use error::RelayError;
pub use server::RelayServer;
pub use wire::{ClientFrame, DeviceEntry, MessageRecord, PresenceRecord, ServerFrame};
