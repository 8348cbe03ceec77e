//! The node's complete protocol state — pure logic, no async, no I/O.
//!
//! Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`;
//! none of them touches the network, the store, or the channels.

use tracing::debug;
use weft_relay::wire::{MessageRecord, PresenceRecord};

use crate::config::MeshConfig;
use crate::error::WeftError;
use crate::packet::{Packet, PacketType};
use crate::pending::{PendingTable, RetryOutcome, RetryPolicy};
use crate::presence::{Presence, SelfDescription};
use crate::registry::{PeerObservation, PeerRegistry, RegistryEvent};
use crate::router::{Router, RouterAction};
use crate::selector::TransportSelector;
use crate::types::{
    DeviceRecord, DeviceType, Message, MessageStatus, NodeId, PendingMessage, TransportKind,
};
use weft_transport::DriverEvent;

use super::effect::{EmitPlan, Feedback, RuntimeEffect};
use super::{relay_record, MeshEvent};

/// Pure protocol state for one node.
pub struct RuntimeState {
    local_id: NodeId,
    local_name: String,
    config: MeshConfig,

    router: Router,
    registry: PeerRegistry,
    selector: TransportSelector,
    pending: PendingTable,
    presence: Presence,
}

impl RuntimeState {
    pub fn new(local_id: NodeId, local_name: String, config: MeshConfig) -> Self {
        let router = Router::new(
            local_id.clone(),
            config.seen_set_high,
            config.seen_set_low,
            config.max_packet_size,
            config.max_ttl,
        );
        let hard_factor =
            (config.hard_peer_timeout_ms / config.soft_peer_timeout_ms.max(1)).max(1);
        let registry = PeerRegistry::with_hard_factor(
            local_id.clone(),
            config.soft_peer_timeout_ms,
            config.soft_peer_timeout_ms * 4, // remote observations age slower
            hard_factor,
        );
        let pending = PendingTable::new(RetryPolicy {
            base_ms: config.retry_base_ms,
            factor: config.retry_factor,
            cap_ms: config.retry_cap_ms,
            max_retries: config.max_retries,
        });
        let presence = Presence::new(SelfDescription::new(
            local_name.clone(),
            config.device_type,
            config.brand_hint.clone(),
        ));
        Self {
            local_id,
            local_name,
            config,
            router,
            registry,
            selector: TransportSelector::new(),
            pending,
            presence,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.devices()
    }

    /// Declare a transport the node carries (before any availability).
    pub fn register_transport(&mut self, kind: TransportKind) {
        self.selector.register(kind);
    }

    /// Restore the durable pending queue after a restart.
    pub fn load_pending(&mut self, entries: Vec<PendingMessage>) {
        for entry in entries {
            let packet = Packet::rebuild_message(
                entry.message.id.clone(),
                &entry.message.sender_id,
                entry.message.receiver_id.clone(),
                entry.message.content.clone(),
                entry.message.timestamp,
                self.config.max_ttl,
            );
            self.pending
                .restore(entry.message, packet, entry.retries, entry.last_attempt);
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// `send_message`: build the packet, persist the message, hand it
    /// to the emitter, and start the at-least-once bookkeeping.
    pub fn handle_send(
        &mut self,
        content: String,
        receiver: NodeId,
        now: u64,
    ) -> Result<(String, Vec<RuntimeEffect>), WeftError> {
        let packet = Packet::message(
            &self.local_id,
            receiver.clone(),
            content.clone(),
            self.config.max_ttl,
        );
        let wire_len = packet.encode()?.len();
        if wire_len > self.config.max_packet_size {
            return Err(WeftError::malformed(format!(
                "message serializes to {wire_len} bytes, exceeding the {} byte packet limit",
                self.config.max_packet_size
            )));
        }

        let message = Message {
            id: packet.id.clone(),
            content,
            sender_id: self.local_id.clone(),
            receiver_id: receiver.clone(),
            timestamp: packet.timestamp,
            hops: vec![self.local_id.clone()],
            status: MessageStatus::Sending,
            retry_count: 0,
        };
        let message_id = message.id.clone();

        let effects = vec![
            RuntimeEffect::PersistMessage {
                message: message.clone(),
                synced: false,
            },
            RuntimeEffect::MirrorToRelay(relay_record(&message)),
            RuntimeEffect::EnqueuePending(PendingMessage {
                id: message_id.clone(),
                message: message.clone(),
                retries: 0,
                last_attempt: now,
            }),
            RuntimeEffect::SendPacket {
                packet: packet.clone(),
                plan: self.plan_for(receiver, now),
                message_id: Some(message_id.clone()),
            },
        ];
        self.pending.register(message, packet, now);
        Ok((message_id, effects))
    }

    /// `retry_message`: nudge a pending entry, or resurrect a failed /
    /// queued message from the store. Only our own messages qualify.
    pub fn handle_retry(
        &mut self,
        message_id: &str,
        stored: Option<Message>,
        now: u64,
    ) -> (bool, Vec<RuntimeEffect>) {
        if self.pending.contains(message_id) {
            let (packet, retries) = {
                let entry = self
                    .pending
                    .touch_attempt(message_id, now)
                    .expect("entry just checked");
                (entry.packet.clone(), entry.retries)
            };
            let plan = self.plan_for(packet.target_id.clone(), now);
            return (
                true,
                vec![
                    RuntimeEffect::UpdatePending {
                        id: message_id.to_string(),
                        retries,
                        last_attempt: now,
                    },
                    RuntimeEffect::SendPacket {
                        packet,
                        plan,
                        message_id: Some(message_id.to_string()),
                    },
                ],
            );
        }

        let Some(mut message) = stored else {
            return (false, Vec::new());
        };
        if message.sender_id != self.local_id
            || !matches!(message.status, MessageStatus::Failed | MessageStatus::Queued)
        {
            return (false, Vec::new());
        }

        let packet = Packet::rebuild_message(
            message.id.clone(),
            &message.sender_id,
            message.receiver_id.clone(),
            message.content.clone(),
            message.timestamp,
            self.config.max_ttl,
        );
        message.status = MessageStatus::Sending;
        message.retry_count = 0;
        let plan = self.plan_for(message.receiver_id.clone(), now);
        let effects = vec![
            RuntimeEffect::PersistStatus {
                message_id: message.id.clone(),
                status: MessageStatus::Sending,
            },
            RuntimeEffect::PersistRetryCount {
                message_id: message.id.clone(),
                retry_count: 0,
            },
            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged {
                message_id: message.id.clone(),
                status: MessageStatus::Sending,
            }),
            RuntimeEffect::EnqueuePending(PendingMessage {
                id: message.id.clone(),
                message: message.clone(),
                retries: 0,
                last_attempt: now,
            }),
            RuntimeEffect::SendPacket {
                packet: packet.clone(),
                plan,
                message_id: Some(message.id.clone()),
            },
        ];
        self.pending.register(message, packet, now);
        (true, effects)
    }

    /// `set_device_name`: rename and re-announce. The store write is
    /// the loop's job.
    pub fn handle_set_name(&mut self, name: String) -> Vec<RuntimeEffect> {
        self.local_name = name.clone();
        self.presence.set_name(name);
        vec![self.broadcast_announce()]
    }

    /// `start_scanning` / `stop_scanning`.
    pub fn handle_scan(&mut self, start: bool) -> Vec<RuntimeEffect> {
        if start {
            if self.presence.start_scan(self.config.scan_announce_burst) {
                return vec![RuntimeEffect::Emit(MeshEvent::ScanStateChanged(true))];
            }
        } else if self.presence.stop_scan() {
            return vec![RuntimeEffect::Emit(MeshEvent::ScanStateChanged(false))];
        }
        Vec::new()
    }

    /// `send_typing_indicator`: a direct PING plus a presence upsert.
    pub fn handle_typing(
        &mut self,
        receiver: NodeId,
        is_typing: bool,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let payload = format!("{{\"isTyping\":{is_typing}}}");
        let plan = self.plan_for(receiver.clone(), now);
        vec![
            RuntimeEffect::SendPacket {
                packet: Packet::ping(&self.local_id, receiver.clone(), payload, self.config.max_ttl),
                plan,
                message_id: None,
            },
            RuntimeEffect::PublishPresence(PresenceRecord {
                is_online: true,
                is_typing,
                typing_to: Some(receiver),
                last_heartbeat: now,
            }),
        ]
    }

    /// `cleanup`: best-effort offline flush before teardown.
    pub fn shutdown_effects(&self) -> Vec<RuntimeEffect> {
        vec![RuntimeEffect::PublishPresence(PresenceRecord {
            is_online: false,
            is_typing: false,
            typing_to: None,
            last_heartbeat: 0,
        })]
    }

    // ── Driver events ────────────────────────────────────────────────

    pub fn handle_driver_event(&mut self, event: DriverEvent, now: u64) -> Vec<RuntimeEffect> {
        match event {
            DriverEvent::Bytes {
                transport,
                from,
                bytes,
            } => self.route_bytes(&bytes, transport, from, now, false),

            DriverEvent::PeerObserved { transport, peer } => {
                let peer_id = peer.id.clone();
                let observation = PeerObservation {
                    id: peer.id,
                    name: peer.name,
                    device_type: peer.device_type.as_deref().map(DeviceType::parse_lossy),
                    signal_strength: peer.signal_strength,
                };
                let mut effects = self.observe_peer(observation, transport, now);
                // Relay-visible peers get our signaling blob so a
                // direct P2P link can form.
                if transport == TransportKind::Relay {
                    effects.push(RuntimeEffect::SendSignal { to: peer_id });
                }
                effects
            }

            DriverEvent::PeerLost { transport, peer_id } => {
                let mut effects = Vec::new();
                if let Some(RegistryEvent::Updated(record)) =
                    self.registry.transport_lost(&peer_id, transport)
                {
                    effects.push(RuntimeEffect::Emit(MeshEvent::DeviceUpdated(record.clone())));
                    effects.push(RuntimeEffect::PersistDevice(record));
                }
                self.selector
                    .set_device_count(transport, self.registry.connected_count_on(transport));
                effects
            }

            DriverEvent::AvailableChanged {
                transport,
                available,
            } => self.handle_available_changed(transport, available, now),

            DriverEvent::SendFailed { transport, .. } => {
                self.selector.record_failure(transport);
                Vec::new()
            }

            DriverEvent::Signal { from, blob } => {
                debug!("signal blob from {from}");
                vec![RuntimeEffect::ConnectSignal(blob)]
            }
        }
    }

    fn handle_available_changed(
        &mut self,
        transport: TransportKind,
        available: bool,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        self.selector.set_available(transport, available);
        let mut effects = vec![RuntimeEffect::Emit(MeshEvent::ConnectionStatusChanged {
            is_online: self.selector.any_available(),
            transports: self.selector.available_transports(),
        })];

        if available {
            // Reconnect drain: re-emit pending entries, floored to
            // avoid a thundering herd on flappy links.
            let candidates = self
                .pending
                .drain_candidates(now, self.config.reconnect_drain_floor_ms);
            for id in candidates {
                let Some((packet, retries)) = self
                    .pending
                    .touch_attempt(&id, now)
                    .map(|e| (e.packet.clone(), e.retries))
                else {
                    continue;
                };
                let plan = self.plan_for(packet.target_id.clone(), now);
                effects.push(RuntimeEffect::UpdatePending {
                    id: id.clone(),
                    retries,
                    last_attempt: now,
                });
                effects.push(RuntimeEffect::SendPacket {
                    packet,
                    plan,
                    message_id: Some(id),
                });
            }
            if transport == TransportKind::Relay {
                effects.push(RuntimeEffect::PublishPresence(self.online_presence(now)));
                effects.push(RuntimeEffect::SyncRelay);
            }
        }
        effects
    }

    // ── Feedback from the executor ───────────────────────────────────

    pub fn handle_feedback(&mut self, feedback: Feedback, now: u64) -> Vec<RuntimeEffect> {
        match feedback {
            Feedback::PacketEmitted {
                message_id,
                succeeded,
                attempts,
            } => {
                for (kind, ok) in attempts {
                    if ok {
                        self.selector.record_success(kind, now);
                    } else {
                        self.selector.record_failure(kind);
                    }
                }
                let Some(id) = message_id else {
                    return Vec::new();
                };
                let Some(status) = self.pending.get(&id).map(|e| e.message.status) else {
                    return Vec::new(); // ACKed before the send resolved
                };
                match (succeeded, status) {
                    (Some(_), MessageStatus::Sending | MessageStatus::Queued) => {
                        self.pending.set_message_status(&id, MessageStatus::Sent);
                        let record = self
                            .pending
                            .get(&id)
                            .map(|e| relay_record(&e.message));
                        let mut effects = vec![
                            RuntimeEffect::PersistStatus {
                                message_id: id.clone(),
                                status: MessageStatus::Sent,
                            },
                            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged {
                                message_id: id,
                                status: MessageStatus::Sent,
                            }),
                        ];
                        if let Some(record) = record {
                            effects.push(RuntimeEffect::MirrorToRelay(record));
                        }
                        effects
                    }
                    (None, MessageStatus::Sending) => {
                        // Every transport failed: park the message.
                        self.pending.set_message_status(&id, MessageStatus::Queued);
                        vec![
                            RuntimeEffect::PersistStatus {
                                message_id: id.clone(),
                                status: MessageStatus::Queued,
                            },
                            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged {
                                message_id: id,
                                status: MessageStatus::Queued,
                            }),
                        ]
                    }
                    _ => Vec::new(),
                }
            }

            Feedback::InboxFetched { records } => {
                let mut effects = Vec::new();
                for record in records {
                    effects.extend(self.admit_relay_record(record, now));
                }
                effects
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Periodic ANNOUNCE plus the relay presence heartbeat.
    pub fn tick_announce(&mut self, now: u64) -> Vec<RuntimeEffect> {
        vec![
            self.broadcast_announce(),
            RuntimeEffect::PublishPresence(self.online_presence(now)),
        ]
    }

    /// Peer liveness sweep (soft / hard timeouts).
    pub fn tick_sweep(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for event in self.registry.sweep(now) {
            match event {
                RegistryEvent::Updated(record) => {
                    effects.push(RuntimeEffect::Emit(MeshEvent::DeviceUpdated(record.clone())));
                    effects.push(RuntimeEffect::PersistDevice(record));
                }
                RegistryEvent::Lost(id) => {
                    if let Some(record) = self.registry.device(&id) {
                        effects.push(RuntimeEffect::PersistDevice(record.clone()));
                    }
                    effects.push(RuntimeEffect::Emit(MeshEvent::DeviceLost(id)));
                }
                RegistryEvent::Discovered(_) => {}
            }
        }
        effects
    }

    /// Retry scheduler: re-emit due entries, fail exhausted ones.
    pub fn tick_retry(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for id in self.pending.due(now) {
            match self.pending.record_attempt(&id, now) {
                Some(RetryOutcome::Retry { packet, retries }) => {
                    let plan = self.plan_for(packet.target_id.clone(), now);
                    effects.push(RuntimeEffect::UpdatePending {
                        id: id.clone(),
                        retries,
                        last_attempt: now,
                    });
                    effects.push(RuntimeEffect::PersistRetryCount {
                        message_id: id.clone(),
                        retry_count: retries,
                    });
                    effects.push(RuntimeEffect::SendPacket {
                        packet,
                        plan,
                        message_id: Some(id),
                    });
                }
                Some(RetryOutcome::Exhausted { message }) => {
                    debug!("retry budget exhausted for {}", message.id);
                    effects.push(RuntimeEffect::RemovePending {
                        id: message.id.clone(),
                    });
                    effects.push(RuntimeEffect::PersistStatus {
                        message_id: message.id.clone(),
                        status: MessageStatus::Failed,
                    });
                    effects.push(RuntimeEffect::Emit(MeshEvent::MessageStatusChanged {
                        message_id: message.id,
                        status: MessageStatus::Failed,
                    }));
                }
                None => {}
            }
        }
        effects
    }

    /// Scanning burst: one DISCOVER per tick while the burst lasts.
    pub fn tick_scan(&mut self, _now: u64) -> Vec<RuntimeEffect> {
        if !self.presence.is_scanning() {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.presence.tick_scan() {
            effects.push(RuntimeEffect::BroadcastPacket {
                packet: Packet::discover(
                    &self.local_id,
                    self.presence.description().to_payload(),
                    self.config.max_ttl,
                ),
                except: None,
            });
        }
        if !self.presence.is_scanning() {
            effects.push(RuntimeEffect::Emit(MeshEvent::ScanStateChanged(false)));
        }
        effects
    }

    /// Periodic store-and-forward reconciliation.
    pub fn tick_relay_sync(&mut self, _now: u64) -> Vec<RuntimeEffect> {
        vec![RuntimeEffect::SyncRelay]
    }

    /// Age-based device eviction in the store.
    pub fn tick_evict(&mut self, now: u64) -> Vec<RuntimeEffect> {
        vec![RuntimeEffect::EvictOldDevices {
            cutoff: now.saturating_sub(self.config.device_evict_age_ms),
        }]
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Packet ingress (live transport or store-and-forward admission).
    fn route_bytes(
        &mut self,
        bytes: &[u8],
        transport: TransportKind,
        from_peer: NodeId,
        now: u64,
        from_store: bool,
    ) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        for action in self.router.receive(bytes) {
            match action {
                RouterAction::Deliver { message, ack } => {
                    let ack_plan = self.plan_for(ack.target_id.clone(), now);
                    effects.push(RuntimeEffect::DeliverMessage {
                        message,
                        ack,
                        ack_plan,
                        synced: from_store,
                        mark_relay_delivered: from_store,
                    });
                }
                RouterAction::AckConfirmed { message_id } => {
                    if let Some(entry) = self.pending.acknowledge(&message_id) {
                        let mut message = entry.message;
                        message.status = MessageStatus::Delivered;
                        effects.push(RuntimeEffect::RemovePending {
                            id: message_id.clone(),
                        });
                        effects.push(RuntimeEffect::PersistStatus {
                            message_id: message_id.clone(),
                            status: MessageStatus::Delivered,
                        });
                        effects.push(RuntimeEffect::Emit(MeshEvent::MessageStatusChanged {
                            message_id,
                            status: MessageStatus::Delivered,
                        }));
                        effects.push(RuntimeEffect::MirrorToRelay(relay_record(&message)));
                    }
                }
                RouterAction::Observation { observation, .. } => {
                    effects.extend(self.observe_peer(observation, transport, now));
                }
                RouterAction::Refresh { peer } => {
                    if let Some(RegistryEvent::Updated(record)) = self.registry.refresh(&peer, now)
                    {
                        effects.push(RuntimeEffect::Emit(MeshEvent::DeviceUpdated(record.clone())));
                        effects.push(RuntimeEffect::PersistDevice(record));
                    }
                }
                RouterAction::Typing { peer, is_typing } => {
                    if let Some(RegistryEvent::Updated(record)) =
                        self.registry.set_typing(&peer, is_typing, now)
                    {
                        effects.push(RuntimeEffect::Emit(MeshEvent::DeviceUpdated(record)));
                    }
                }
                RouterAction::Relay { packet } => {
                    effects.push(RuntimeEffect::BroadcastPacket {
                        packet,
                        except: Some((transport, from_peer.clone())),
                    });
                }
            }
        }
        effects
    }

    /// Merge a peer observation and owe the one-shot ANNOUNCE to
    /// first-time contacts (accelerated mutual discovery, never
    /// recursive).
    fn observe_peer(
        &mut self,
        observation: PeerObservation,
        transport: TransportKind,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let peer_id = observation.id.clone();
        let mut effects = Vec::new();
        match self.registry.observe(observation, transport, now) {
            Some(RegistryEvent::Discovered(record)) => {
                effects.push(RuntimeEffect::Emit(MeshEvent::DeviceDiscovered(
                    record.clone(),
                )));
                effects.push(RuntimeEffect::PersistDevice(record));
            }
            Some(RegistryEvent::Updated(record)) => {
                effects.push(RuntimeEffect::Emit(MeshEvent::DeviceUpdated(record.clone())));
                effects.push(RuntimeEffect::PersistDevice(record));
            }
            _ => return effects, // observation of ourselves
        }
        self.selector
            .set_device_count(transport, self.registry.connected_count_on(transport));
        if self.presence.first_contact(&peer_id) {
            effects.push(self.broadcast_announce());
        }
        effects
    }

    /// Admit a store-and-forward record as if it had arrived over the
    /// relay transport. Duplicate suppression still applies.
    fn admit_relay_record(&mut self, record: MessageRecord, now: u64) -> Vec<RuntimeEffect> {
        if record.receiver_id != self.local_id {
            return Vec::new();
        }
        let hops = if record.hops.first() == Some(&record.sender_id) {
            record.hops.clone()
        } else {
            vec![record.sender_id.clone()]
        };
        let last_hop = hops.last().cloned().unwrap_or(record.sender_id.clone());
        let mut packet = Packet {
            id: record.message_id,
            packet_type: PacketType::Message,
            sender_id: last_hop.clone(),
            original_sender_id: record.sender_id,
            target_id: self.local_id.clone(),
            payload: record.content,
            timestamp: record.created_at,
            ttl: 0, // addressed to us; nothing to relay
            hops,
            signature: String::new(),
        };
        packet.seal();
        match packet.encode() {
            Ok(bytes) => self.route_bytes(&bytes, TransportKind::Relay, last_hop, now, true),
            Err(_) => Vec::new(),
        }
    }

    fn plan_for(&self, target: NodeId, now: u64) -> EmitPlan {
        let attempts = self.selector.attempt_order(
            |kind| target.is_wildcard() || self.registry.peer_supports(&target, kind),
            now,
        );
        EmitPlan { target, attempts }
    }

    fn broadcast_announce(&self) -> RuntimeEffect {
        RuntimeEffect::BroadcastPacket {
            packet: Packet::announce(
                &self.local_id,
                self.presence.description().to_payload(),
                self.config.max_ttl,
            ),
            except: None,
        }
    }

    fn online_presence(&self, now: u64) -> PresenceRecord {
        PresenceRecord {
            is_online: true,
            is_typing: false,
            typing_to: None,
            last_heartbeat: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn state(local: &str) -> RuntimeState {
        let mut state = RuntimeState::new(node(local), format!("node-{local}"), MeshConfig::default());
        state.register_transport(TransportKind::Lan);
        state.handle_driver_event(
            DriverEvent::AvailableChanged {
                transport: TransportKind::Lan,
                available: true,
            },
            0,
        );
        state
    }

    fn find_sent_packet(effects: &[RuntimeEffect]) -> &Packet {
        effects
            .iter()
            .find_map(|e| match e {
                RuntimeEffect::SendPacket { packet, .. } => Some(packet),
                _ => None,
            })
            .expect("no SendPacket effect")
    }

    #[test]
    fn send_produces_persist_mirror_enqueue_and_emit() {
        let mut s = state("AAAA1111");
        let (id, effects) = s
            .handle_send("hello".into(), node("BBBB2222"), 1_000)
            .unwrap();

        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::PersistMessage { message, synced: false } if message.id == id)));
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::MirrorToRelay(r) if r.message_id == id)));
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::EnqueuePending(p) if p.id == id)));
        let packet = find_sent_packet(&effects);
        assert_eq!(packet.id, id);
        assert_eq!(packet.ttl, 10);
        assert!(s.pending_contains(&id));
    }

    #[test]
    fn oversize_send_rejected() {
        let mut s = state("AAAA1111");
        let result = s.handle_send("x".repeat(600), node("BBBB2222"), 1_000);
        assert!(matches!(result, Err(WeftError::MalformedPacket { .. })));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn send_feedback_success_moves_to_sent() {
        let mut s = state("AAAA1111");
        let (id, _) = s.handle_send("hi".into(), node("BBBB2222"), 1_000).unwrap();

        let effects = s.handle_feedback(
            Feedback::PacketEmitted {
                message_id: Some(id.clone()),
                succeeded: Some(TransportKind::Lan),
                attempts: vec![(TransportKind::Lan, true)],
            },
            1_100,
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged { status: MessageStatus::Sent, .. })
        )));

        // A later retry success does not re-announce `sent`.
        let effects = s.handle_feedback(
            Feedback::PacketEmitted {
                message_id: Some(id),
                succeeded: Some(TransportKind::Lan),
                attempts: vec![(TransportKind::Lan, true)],
            },
            1_200,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn send_feedback_all_failed_queues() {
        let mut s = state("AAAA1111");
        let (id, _) = s.handle_send("hi".into(), node("BBBB2222"), 1_000).unwrap();

        let effects = s.handle_feedback(
            Feedback::PacketEmitted {
                message_id: Some(id.clone()),
                succeeded: None,
                attempts: vec![(TransportKind::Lan, false)],
            },
            1_100,
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged { status: MessageStatus::Queued, .. })
        )));
        // Still pending: the drain or retry timer will pick it up.
        assert!(s.pending_contains(&id));
    }

    #[test]
    fn ack_ingress_completes_delivery() {
        let mut s = state("AAAA1111");
        let (id, _) = s.handle_send("hi".into(), node("BBBB2222"), 1_000).unwrap();

        let ack = Packet::ack(&node("BBBB2222"), node("AAAA1111"), &id, 10);
        let effects = s.handle_driver_event(
            DriverEvent::Bytes {
                transport: TransportKind::Lan,
                from: node("BBBB2222"),
                bytes: ack.encode().unwrap(),
            },
            2_000,
        );

        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged { status: MessageStatus::Delivered, .. })
        )));
        assert!(effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::RemovePending { id: removed } if *removed == id)));
        assert!(!s.pending_contains(&id));

        // No retries are scheduled for a delivered message.
        assert!(s.tick_retry(10_000_000).is_empty());
    }

    #[test]
    fn retry_tick_reemits_then_exhausts() {
        let config = MeshConfig::default().retry_schedule(100, 1_000, 3);
        let mut s = RuntimeState::new(node("AAAA1111"), "a".into(), config);
        s.register_transport(TransportKind::Lan);
        let (id, _) = s.handle_send("hi".into(), node("BBBB2222"), 0).unwrap();

        // First due fire: re-emit with retries = 1.
        let effects = s.tick_retry(200);
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::SendPacket { message_id: Some(m), .. } if *m == id
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::PersistRetryCount { retry_count: 1, .. }
        )));

        // Drive to exhaustion (max_retries = 3).
        let mut failed = false;
        for t in 1..10u64 {
            let effects = s.tick_retry(t * 10_000);
            if effects.iter().any(|e| matches!(
                e,
                RuntimeEffect::Emit(MeshEvent::MessageStatusChanged { status: MessageStatus::Failed, .. })
            )) {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(!s.pending_contains(&id));
    }

    #[test]
    fn reconnect_drain_respects_floor() {
        let mut s = state("AAAA1111");
        let (id, _) = s.handle_send("hi".into(), node("BBBB2222"), 0).unwrap();

        // 5s later: below the 10s floor — no drain re-emission.
        let effects = s.handle_driver_event(
            DriverEvent::AvailableChanged {
                transport: TransportKind::Lan,
                available: true,
            },
            5_000,
        );
        assert!(!effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::SendPacket { .. })));

        // 15s later: drained.
        let effects = s.handle_driver_event(
            DriverEvent::AvailableChanged {
                transport: TransportKind::Lan,
                available: true,
            },
            15_000,
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::SendPacket { message_id: Some(m), .. } if *m == id
        )));
    }

    #[test]
    fn message_ingress_delivers_with_ack_and_relays_nothing_for_us() {
        let mut s = state("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "inbound".into(), 10);
        let effects = s.handle_driver_event(
            DriverEvent::Bytes {
                transport: TransportKind::Lan,
                from: node("AAAA1111"),
                bytes: packet.encode().unwrap(),
            },
            1_000,
        );
        match effects
            .iter()
            .find(|e| matches!(e, RuntimeEffect::DeliverMessage { .. }))
        {
            Some(RuntimeEffect::DeliverMessage { message, ack, synced, .. }) => {
                assert_eq!(message.content, "inbound");
                assert_eq!(ack.target_id, node("AAAA1111"));
                assert!(!synced);
            }
            _ => panic!("expected DeliverMessage"),
        }
        assert!(!effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::BroadcastPacket { .. })));
    }

    #[test]
    fn foreign_message_is_relayed_excluding_arrival_pair() {
        let mut s = state("BBBB2222");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "through".into(), 10);
        let effects = s.handle_driver_event(
            DriverEvent::Bytes {
                transport: TransportKind::Lan,
                from: node("AAAA1111"),
                bytes: packet.encode().unwrap(),
            },
            1_000,
        );
        match effects
            .iter()
            .find(|e| matches!(e, RuntimeEffect::BroadcastPacket { .. }))
        {
            Some(RuntimeEffect::BroadcastPacket { packet: copy, except }) => {
                assert_eq!(copy.ttl, 9);
                assert_eq!(
                    *except,
                    Some((TransportKind::Lan, node("AAAA1111")))
                );
            }
            _ => panic!("expected BroadcastPacket"),
        }
    }

    #[test]
    fn first_observation_triggers_one_shot_announce() {
        let mut s = state("AAAA1111");
        let effects = s.handle_driver_event(
            DriverEvent::PeerObserved {
                transport: TransportKind::Lan,
                peer: weft_transport::PeerDescriptor::new(node("BBBB2222")),
            },
            1_000,
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::Emit(MeshEvent::DeviceDiscovered(_)))));
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::BroadcastPacket { packet, .. } if packet.packet_type == PacketType::Announce
        )));

        // Second observation: update only, no announce.
        let effects = s.handle_driver_event(
            DriverEvent::PeerObserved {
                transport: TransportKind::Lan,
                peer: weft_transport::PeerDescriptor::new(node("BBBB2222")),
            },
            2_000,
        );
        assert!(!effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::BroadcastPacket { .. })));
    }

    #[test]
    fn scan_lifecycle() {
        let mut s = state("AAAA1111");
        let effects = s.handle_scan(true);
        assert!(effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::Emit(MeshEvent::ScanStateChanged(true)))));

        let mut discovers = 0;
        loop {
            let effects = s.tick_scan(0);
            if effects.iter().any(|e| matches!(
                e,
                RuntimeEffect::BroadcastPacket { packet, .. } if packet.packet_type == PacketType::Discover
            )) {
                discovers += 1;
            }
            if effects
                .iter()
                .any(|e| matches!(e, RuntimeEffect::Emit(MeshEvent::ScanStateChanged(false))))
            {
                break;
            }
            assert!(discovers < 20, "scan never terminated");
        }
        assert_eq!(discovers, MeshConfig::default().scan_announce_burst);
    }

    #[test]
    fn relay_record_admission_flows_through_router() {
        let mut s = state("CCCC3333");
        let record = MessageRecord {
            message_id: "1700000000000-00c0ffee".into(),
            sender_id: node("AAAA1111"),
            receiver_id: node("CCCC3333"),
            content: "from the relay".into(),
            status: "sent".into(),
            hops: vec![node("AAAA1111")],
            created_at: 1_700_000_000_000,
        };
        let effects = s.handle_feedback(
            Feedback::InboxFetched {
                records: vec![record.clone()],
            },
            2_000,
        );
        match effects
            .iter()
            .find(|e| matches!(e, RuntimeEffect::DeliverMessage { .. }))
        {
            Some(RuntimeEffect::DeliverMessage {
                message,
                synced,
                mark_relay_delivered,
                ..
            }) => {
                assert_eq!(message.id, record.message_id);
                assert!(*synced);
                assert!(*mark_relay_delivered);
            }
            _ => panic!("expected DeliverMessage"),
        }

        // Admitting the same record twice: seen-set drops it.
        let effects = s.handle_feedback(Feedback::InboxFetched { records: vec![record] }, 3_000);
        assert!(!effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::DeliverMessage { .. })));
    }

    #[test]
    fn retry_message_resurrects_failed() {
        let mut s = state("AAAA1111");
        let stored = Message {
            id: "old-id".into(),
            content: "stale".into(),
            sender_id: node("AAAA1111"),
            receiver_id: node("BBBB2222"),
            timestamp: 500,
            hops: vec![node("AAAA1111")],
            status: MessageStatus::Failed,
            retry_count: 20,
        };
        let (ok, effects) = s.handle_retry("old-id", Some(stored), 1_000);
        assert!(ok);
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(MeshEvent::MessageStatusChanged { status: MessageStatus::Sending, .. })
        )));
        assert!(s.pending_contains("old-id"));

        // Unknown or foreign messages are refused.
        let (ok, _) = s.handle_retry("ghost", None, 1_000);
        assert!(!ok);
    }

    #[test]
    fn typing_command_emits_ping_and_presence() {
        let mut s = state("AAAA1111");
        let effects = s.handle_typing(node("BBBB2222"), true, 1_000);
        match effects
            .iter()
            .find(|e| matches!(e, RuntimeEffect::SendPacket { .. }))
        {
            Some(RuntimeEffect::SendPacket { packet, .. }) => {
                assert_eq!(packet.packet_type, PacketType::Ping);
                assert_eq!(packet.payload, "{\"isTyping\":true}");
            }
            _ => panic!("expected SendPacket"),
        }
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::PublishPresence(p) if p.is_typing && p.typing_to == Some(node("BBBB2222"))
        )));
    }
}

#[cfg(test)]
impl RuntimeState {
    fn pending_contains(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
