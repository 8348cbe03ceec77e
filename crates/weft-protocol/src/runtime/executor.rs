//! Effect executor — the only place that touches I/O.
//!
//! Takes a list of RuntimeEffect and executes them concretely:
//! packet emission via the driver set, durable writes via the store
//! (with bounded write retries), record mirroring via the relay
//! client, and event emission to the application channel. Send results
//! and inbox fetches come back as Feedback for the pure state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use weft_store::{MeshStore, StoreError};
use weft_transport::TransportDriver;

use crate::packet::Packet;
use crate::types::{NodeId, TransportKind};

use super::effect::{EmitPlan, Feedback, RuntimeEffect};
use super::{relay_record, DriverSet, MeshEvent};

/// Attempts for one durable write before giving up.
const STORE_WRITE_ATTEMPTS: u32 = 3;

pub(super) struct Executor {
    drivers: DriverSet,
    store: Arc<MeshStore>,
    events: mpsc::Sender<MeshEvent>,
}

impl Executor {
    pub fn new(drivers: DriverSet, store: Arc<MeshStore>, events: mpsc::Sender<MeshEvent>) -> Self {
        Self {
            drivers,
            store,
            events,
        }
    }

    pub async fn stop_drivers(&self) {
        self.drivers.stop_all().await;
    }

    /// Execute effects in order; returns the feedback for the state.
    pub async fn execute(&self, effects: Vec<RuntimeEffect>) -> Vec<Feedback> {
        let mut feedback = Vec::new();
        for effect in effects {
            match effect {
                RuntimeEffect::Emit(event) => {
                    // try_send: never block the runtime on a slow
                    // consumer; the buffer is generous.
                    let _ = self.events.try_send(event);
                }

                RuntimeEffect::SendPacket {
                    packet,
                    plan,
                    message_id,
                } => {
                    let (succeeded, attempts) = self.emit_packet(&packet, &plan).await;
                    feedback.push(Feedback::PacketEmitted {
                        message_id,
                        succeeded,
                        attempts,
                    });
                }

                RuntimeEffect::BroadcastPacket { packet, except } => {
                    let attempts = self.broadcast_packet(&packet, except.as_ref()).await;
                    feedback.push(Feedback::PacketEmitted {
                        message_id: None,
                        succeeded: attempts.iter().find(|(_, ok)| *ok).map(|(k, _)| *k),
                        attempts,
                    });
                }

                RuntimeEffect::DeliverMessage {
                    message,
                    ack,
                    ack_plan,
                    synced,
                    mark_relay_delivered,
                } => {
                    // Durable gate: never surface the same message twice
                    // across restarts.
                    let exists = self.store.message_exists(&message.id).unwrap_or(false);
                    if !exists {
                        self.store_write(|| self.store.insert_message(&message, synced))
                            .await;
                        let _ = self.events.try_send(MeshEvent::MessageReceived(message.clone()));
                    }
                    if mark_relay_delivered {
                        if let Some(relay) = self.drivers.relay() {
                            relay.mark_delivered(message.id.clone());
                        }
                    }
                    // The ACK goes out even for duplicates — the origin
                    // may have missed the first one.
                    let (succeeded, attempts) = self.emit_packet(&ack, &ack_plan).await;
                    feedback.push(Feedback::PacketEmitted {
                        message_id: None,
                        succeeded,
                        attempts,
                    });
                }

                RuntimeEffect::PersistMessage { message, synced } => {
                    self.store_write(|| self.store.insert_message(&message, synced))
                        .await;
                }
                RuntimeEffect::PersistStatus { message_id, status } => {
                    self.store_write(|| {
                        self.store.update_message_status(&message_id, status).map(|_| ())
                    })
                    .await;
                }
                RuntimeEffect::PersistRetryCount {
                    message_id,
                    retry_count,
                } => {
                    self.store_write(|| self.store.update_message_retries(&message_id, retry_count))
                        .await;
                }
                RuntimeEffect::PersistDevice(device) => {
                    self.store_write(|| self.store.upsert_device(&device)).await;
                }
                RuntimeEffect::EnqueuePending(pending) => {
                    self.store_write(|| self.store.enqueue_pending(&pending)).await;
                }
                RuntimeEffect::UpdatePending {
                    id,
                    retries,
                    last_attempt,
                } => {
                    self.store_write(|| self.store.update_pending(&id, retries, last_attempt))
                        .await;
                }
                RuntimeEffect::RemovePending { id } => {
                    self.store_write(|| self.store.remove_pending(&id).map(|_| ()))
                        .await;
                }
                RuntimeEffect::EvictOldDevices { cutoff } => {
                    if let Err(e) = self.store.evict_devices_older_than(cutoff) {
                        warn!("device eviction failed: {e}");
                    }
                }

                RuntimeEffect::MirrorToRelay(record) => {
                    if let Some(relay) = self.drivers.relay() {
                        relay.store_message(record);
                    }
                }
                RuntimeEffect::PublishPresence(presence) => {
                    if let Some(relay) = self.drivers.relay() {
                        relay.publish_presence(presence);
                    }
                }
                RuntimeEffect::SyncRelay => {
                    if let Some(records) = self.sync_relay().await {
                        feedback.push(Feedback::InboxFetched { records });
                    }
                }

                RuntimeEffect::ConnectSignal(blob) => {
                    if let Some(p2p) = self.drivers.p2p() {
                        if let Err(e) = p2p.connect_signal(&blob).await {
                            debug!("p2p bootstrap via signal failed: {e}");
                        }
                    }
                }
                RuntimeEffect::SendSignal { to } => {
                    if let (Some(p2p), Some(relay)) = (self.drivers.p2p(), self.drivers.relay()) {
                        if let Some(blob) = p2p.local_signal() {
                            relay.send_signal(to, blob);
                        }
                    }
                }
            }
        }
        feedback
    }

    // ── Packet emission ──────────────────────────────────────────────

    /// Try the planned transports in order; first success wins. A peer
    /// connected on the transport gets a direct send, otherwise the
    /// packet floods toward potential relays.
    async fn emit_packet(
        &self,
        packet: &Packet,
        plan: &EmitPlan,
    ) -> (Option<TransportKind>, Vec<(TransportKind, bool)>) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("unencodable packet {}: {e}", packet.id);
                return (None, Vec::new());
            }
        };
        let mut attempts = Vec::new();
        for &kind in &plan.attempts {
            let Some(driver) = self.drivers.get(kind) else {
                continue;
            };
            if !driver.is_available() {
                attempts.push((kind, false));
                continue;
            }
            let result = if plan.target.is_wildcard() {
                driver.broadcast(&bytes).await
            } else if driver.connected_peers().await.contains(&plan.target) {
                driver.send(&plan.target, &bytes).await
            } else {
                driver.broadcast(&bytes).await
            };
            match result {
                Ok(()) => {
                    attempts.push((kind, true));
                    return (Some(kind), attempts);
                }
                Err(e) => {
                    debug!("emit on {kind} failed: {e}");
                    attempts.push((kind, false));
                }
            }
        }
        (None, attempts)
    }

    /// Relay fan-out: every available transport, skipping the arrival
    /// pair (individual sends on that transport instead of a blanket
    /// broadcast).
    async fn broadcast_packet(
        &self,
        packet: &Packet,
        except: Option<&(TransportKind, NodeId)>,
    ) -> Vec<(TransportKind, bool)> {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("unencodable packet {}: {e}", packet.id);
                return Vec::new();
            }
        };
        let mut attempts = Vec::new();
        for driver in self.drivers.all() {
            if !driver.is_available() {
                continue;
            }
            let kind = driver.kind();
            let ok = match except {
                Some((except_kind, except_peer)) if *except_kind == kind => {
                    let mut any = false;
                    let mut all_ok = true;
                    for peer in driver.connected_peers().await {
                        if peer == *except_peer {
                            continue;
                        }
                        any = true;
                        if let Err(e) = driver.send(&peer, &bytes).await {
                            debug!("relay send to {peer} on {kind} failed: {e}");
                            all_ok = false;
                        }
                    }
                    !any || all_ok
                }
                _ => match driver.broadcast(&bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("broadcast on {kind} failed: {e}");
                        false
                    }
                },
            };
            attempts.push((kind, ok));
        }
        attempts
    }

    // ── Rendezvous sync ──────────────────────────────────────────────

    /// Upload unsynced local messages, then fetch our inbox. Returns
    /// the records absent from the local store, or `None` when the
    /// relay is unreachable.
    async fn sync_relay(&self) -> Option<Vec<weft_relay::wire::MessageRecord>> {
        let relay = self.drivers.relay()?;
        if !relay.is_available() {
            return None;
        }

        // Read errors are treated as empty (best effort).
        for message in self.store.unsynced_messages().unwrap_or_default() {
            relay.store_message(relay_record(&message));
            self.store_write(|| self.store.mark_synced(&message.id)).await;
        }

        match relay.fetch_inbox().await {
            Ok(records) => Some(
                records
                    .into_iter()
                    .filter(|r| !self.store.message_exists(&r.message_id).unwrap_or(false))
                    .collect(),
            ),
            Err(e) => {
                debug!("inbox fetch failed: {e}");
                None
            }
        }
    }

    /// Durable write with bounded retries; the final failure is logged
    /// and swallowed (the caller already chose a degraded path).
    async fn store_write<F>(&self, mut op: F)
    where
        F: FnMut() -> Result<(), StoreError>,
    {
        for attempt in 0..STORE_WRITE_ATTEMPTS {
            match op() {
                Ok(()) => return,
                Err(e) if attempt + 1 < STORE_WRITE_ATTEMPTS => {
                    debug!("store write failed (attempt {}): {e}", attempt + 1);
                    tokio::time::sleep(Duration::from_millis(25 << attempt)).await;
                }
                Err(e) => warn!("store write failed permanently: {e}"),
            }
        }
    }
}
