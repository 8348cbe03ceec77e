//! Durable local store for the Weft mesh.
//!
//! One SQLite database per node: `devices`, `messages` (indexed by
//! conversation key, sync flag, and timestamp), `pending_messages`
//! (the offline retry queue), `config`, and `identity`. All writes go
//! through a single connection behind a mutex — the store is the one
//! place where node state survives restarts.

pub mod error;
pub mod records;
pub mod store;

pub use error::StoreError;
pub use records::{
    conversation_key, DeviceRecord, DeviceType, Message, MessageStatus, PendingMessage,
};
pub use store::MeshStore;
