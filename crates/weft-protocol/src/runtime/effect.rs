//! Intentions produced by the pure runtime state.
//!
//! Every `handle_*` / `tick_*` method on `RuntimeState` returns
//! `Vec<RuntimeEffect>`; none of them touches the network, the store,
//! or the channels. The executor turns effects into I/O and reports
//! send results and inbox fetches back as [`Feedback`].

use weft_relay::wire::{MessageRecord, PresenceRecord};

use crate::packet::Packet;
use crate::types::{
    DeviceRecord, Message, MessageStatus, NodeId, PendingMessage, SignalBlob, TransportKind,
};

use super::MeshEvent;

/// Ordered transport attempts for emitting one packet toward a peer.
#[derive(Debug, Clone)]
pub struct EmitPlan {
    pub target: NodeId,
    pub attempts: Vec<TransportKind>,
}

#[derive(Debug)]
pub enum RuntimeEffect {
    /// Surface an event to the application.
    Emit(MeshEvent),

    /// Emit a packet toward `plan.target`, trying transports in order;
    /// first success wins. The executor answers with
    /// [`Feedback::PacketEmitted`].
    SendPacket {
        packet: Packet,
        plan: EmitPlan,
        /// Set for MESSAGE packets so the delivery pipeline can move
        /// the message's status on the outcome.
        message_id: Option<String>,
    },

    /// Flood a packet on every available transport. `except` skips the
    /// (transport, peer) pair the packet arrived on — the hop list is
    /// the general cycle guard, this only avoids immediate ping-pong.
    BroadcastPacket {
        packet: Packet,
        except: Option<(TransportKind, NodeId)>,
    },

    /// Local delivery behind the durable `message_exists` gate. The
    /// ACK goes out regardless (the origin may have missed an earlier
    /// one). `synced`/`mark_relay_delivered` apply to store-and-forward
    /// admissions.
    DeliverMessage {
        message: Message,
        ack: Packet,
        ack_plan: EmitPlan,
        synced: bool,
        mark_relay_delivered: bool,
    },

    // ── Durable store ────────────────────────────────────────────────
    PersistMessage { message: Message, synced: bool },
    PersistStatus { message_id: String, status: MessageStatus },
    PersistRetryCount { message_id: String, retry_count: u32 },
    PersistDevice(DeviceRecord),
    EnqueuePending(PendingMessage),
    UpdatePending { id: String, retries: u32, last_attempt: u64 },
    RemovePending { id: String },
    EvictOldDevices { cutoff: u64 },

    // ── Rendezvous relay ─────────────────────────────────────────────
    /// Idempotent upsert into the relay's message record store.
    MirrorToRelay(MessageRecord),
    PublishPresence(PresenceRecord),
    /// Fetch our store-and-forward inbox and upload locally unsynced
    /// messages. The executor answers with [`Feedback::InboxFetched`].
    SyncRelay,

    // ── P2P bootstrap ────────────────────────────────────────────────
    /// Apply a peer's signaling blob to the P2P driver.
    ConnectSignal(SignalBlob),
    /// Publish our own signaling blob to `to` through the relay.
    SendSignal { to: NodeId },
}

/// Results the executor reports back into the pure state.
#[derive(Debug)]
pub enum Feedback {
    /// Outcome of a `SendPacket` (or the per-transport results of a
    /// broadcast). Feeds the selector and the message status pipeline.
    PacketEmitted {
        message_id: Option<String>,
        succeeded: Option<TransportKind>,
        attempts: Vec<(TransportKind, bool)>,
    },
    /// Store-and-forward records fetched from the relay, already
    /// filtered down to ids absent from the local store.
    InboxFetched { records: Vec<MessageRecord> },
}
