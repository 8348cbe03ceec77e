//! The routing engine — pure decision logic.
//!
//! Ingress order is fixed: size gate, decode, digest verify, seen-set
//! filter, seen-set insert, dispatch by type, relay decision. The
//! caller (runtime) executes the returned actions; the router does no
//! I/O and holds no transport state.
//!
//! The seen-set check-and-insert happens inside one `&mut self` call,
//! so concurrent receipts of the same packet on several transports
//! collapse to a single delivery and a single relay as long as the
//! runtime funnels all ingress through one task (it does).

use serde::Deserialize;
use tracing::{debug, trace};

use crate::metrics::RouterStats;
use crate::packet::{Packet, PacketType};
use crate::registry::PeerObservation;
use crate::seen::SeenSet;
use crate::types::{Message, MessageStatus, NodeId};

/// Typing-indicator payload carried by PING packets.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    is_typing: bool,
}

/// What the runtime must do with an ingressed packet.
#[derive(Debug)]
pub enum RouterAction {
    /// A MESSAGE for us: persist + surface (behind the durable
    /// `message_exists` gate) and send the prepared ACK toward origin.
    Deliver { message: Message, ack: Packet },
    /// An ACK for us: correlate with the pending-retry table.
    AckConfirmed { message_id: String },
    /// A presence payload: merge into the peer registry.
    Observation {
        observation: PeerObservation,
        packet_type: PacketType,
    },
    /// A PING keepalive: refresh the peer's liveness.
    Refresh { peer: NodeId },
    /// A PING carrying a typing indicator.
    Typing { peer: NodeId, is_typing: bool },
    /// Re-emit this relay copy on every transport except the arrival
    /// pair (the runtime knows which one that was).
    Relay { packet: Packet },
}

/// Per-node routing engine.
pub struct Router {
    local_id: NodeId,
    seen: SeenSet,
    stats: RouterStats,
    max_packet_size: usize,
    max_ttl: u8,
}

impl Router {
    pub fn new(
        local_id: NodeId,
        seen_high: usize,
        seen_low: usize,
        max_packet_size: usize,
        max_ttl: u8,
    ) -> Self {
        Self {
            local_id,
            seen: SeenSet::new(seen_high, seen_low),
            stats: RouterStats::default(),
            max_packet_size,
            max_ttl,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Packet ingress. Empty result means silent drop.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<RouterAction> {
        let packet = match Packet::decode(bytes, self.max_packet_size) {
            Ok(packet) => packet,
            Err(e) => {
                if bytes.len() > self.max_packet_size {
                    self.stats.dropped_oversize.inc();
                } else {
                    self.stats.dropped_malformed.inc();
                }
                debug!("router: dropping undecodable packet: {e}");
                return Vec::new();
            }
        };

        if !packet.verify() {
            self.stats.dropped_bad_digest.inc();
            debug!("router: digest mismatch on packet {}", packet.id);
            return Vec::new();
        }

        if self.seen.contains(&packet.id) {
            self.stats.dropped_duplicate.inc();
            trace!("router: duplicate packet {}", packet.id);
            return Vec::new();
        }
        self.seen.insert(&packet.id);

        let mut actions = Vec::new();
        let for_us = packet.target_id == self.local_id || packet.target_id.is_wildcard();

        match packet.packet_type {
            PacketType::Message | PacketType::Relay => {
                if for_us {
                    self.stats.delivered.inc();
                    actions.push(self.deliver_action(&packet));
                }
            }
            PacketType::Ack => {
                if for_us {
                    self.stats.acked.inc();
                    actions.push(RouterAction::AckConfirmed {
                        message_id: packet.payload.clone(),
                    });
                }
            }
            PacketType::Discover | PacketType::Announce => {
                actions.push(RouterAction::Observation {
                    observation: observation_from(&packet),
                    packet_type: packet.packet_type,
                });
            }
            PacketType::Ping => match serde_json::from_str::<TypingPayload>(&packet.payload) {
                Ok(typing) => actions.push(RouterAction::Typing {
                    peer: packet.original_sender_id.clone(),
                    is_typing: typing.is_typing,
                }),
                Err(_) => actions.push(RouterAction::Refresh {
                    peer: packet.original_sender_id.clone(),
                }),
            },
        }

        if packet.should_relay(&self.local_id) {
            self.stats.relayed.inc();
            actions.push(RouterAction::Relay {
                packet: packet.relay_copy(&self.local_id),
            });
        }

        actions
    }

    fn deliver_action(&self, packet: &Packet) -> RouterAction {
        let receiver_id = if packet.target_id.is_wildcard() {
            self.local_id.clone()
        } else {
            packet.target_id.clone()
        };
        let message = Message {
            id: packet.id.clone(),
            content: packet.payload.clone(),
            sender_id: packet.original_sender_id.clone(),
            receiver_id,
            timestamp: packet.timestamp,
            // The receiver records the path as carried; it does not
            // append itself.
            hops: packet.hops.clone(),
            status: MessageStatus::Delivered,
            retry_count: 0,
        };
        let ack = Packet::ack(
            &self.local_id,
            packet.original_sender_id.clone(),
            &packet.id,
            self.max_ttl,
        );
        RouterAction::Deliver { message, ack }
    }
}

fn observation_from(packet: &Packet) -> PeerObservation {
    let mut observation = PeerObservation::bare(packet.original_sender_id.clone());
    if let Some(description) = crate::presence::SelfDescription::parse(&packet.payload) {
        observation.name = Some(description.name);
        observation.device_type = Some(description.device_type);
    }
    observation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PACKET_SIZE;
    use crate::presence::SelfDescription;
    use crate::types::DeviceType;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn router(local: &str) -> Router {
        Router::new(node(local), 2000, 1000, MAX_PACKET_SIZE, 10)
    }

    fn wire(packet: &Packet) -> Vec<u8> {
        packet.encode().unwrap()
    }

    // ── Local delivery ─────────────────────────────────────────────────

    #[test]
    fn message_for_us_delivers_and_acks() {
        let mut r = router("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "hello".into(), 10);

        let actions = r.receive(&wire(&packet));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RouterAction::Deliver { message, ack } => {
                assert_eq!(message.id, packet.id);
                assert_eq!(message.content, "hello");
                assert_eq!(message.sender_id, node("AAAA1111"));
                assert_eq!(message.receiver_id, node("CCCC3333"));
                assert_eq!(message.status, MessageStatus::Delivered);
                assert_eq!(message.hops, vec![node("AAAA1111")]);

                assert_eq!(ack.packet_type, PacketType::Ack);
                assert_eq!(ack.payload, packet.id);
                assert_eq!(ack.target_id, node("AAAA1111"));
                assert_eq!(ack.ttl, 10);
                assert!(ack.verify());
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
        assert_eq!(r.stats().delivered.get(), 1);
    }

    #[test]
    fn relayed_message_keeps_origin_as_sender() {
        let mut r = router("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "via B".into(), 10);
        let relayed = packet.relay_copy(&node("BBBB2222"));

        let actions = r.receive(&wire(&relayed));
        match &actions[0] {
            RouterAction::Deliver { message, ack } => {
                assert_eq!(message.sender_id, node("AAAA1111"));
                assert_eq!(message.hops, vec![node("AAAA1111"), node("BBBB2222")]);
                // The receiver never appears in the delivered hop list.
                assert!(!message.hops.contains(&node("CCCC3333")));
                // ACK goes to the origin, not the last hop.
                assert_eq!(ack.target_id, node("AAAA1111"));
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_message_delivered_and_relayed() {
        let mut r = router("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), NodeId::wildcard(), "to all".into(), 10);

        let actions = r.receive(&wire(&packet));
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], RouterAction::Deliver { .. }));
        match &actions[1] {
            RouterAction::Relay { packet: copy } => {
                assert_eq!(copy.ttl, 9);
                assert_eq!(copy.sender_id, node("CCCC3333"));
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    // ── Duplicate suppression ──────────────────────────────────────────

    #[test]
    fn second_receipt_is_dropped_entirely() {
        let mut r = router("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "once".into(), 10);

        assert_eq!(r.receive(&wire(&packet)).len(), 1);
        // The same packet arriving over another transport produces
        // nothing — one delivery, one ACK overall.
        assert!(r.receive(&wire(&packet)).is_empty());
        assert_eq!(r.stats().delivered.get(), 1);
        assert_eq!(r.stats().dropped_duplicate.get(), 1);
    }

    #[test]
    fn relay_copy_of_seen_packet_is_also_dropped() {
        let mut r = router("DDDD4444");
        let packet = Packet::message(&node("AAAA1111"), node("EEEE5555"), "flood".into(), 10);

        let first = r.receive(&wire(&packet));
        assert!(matches!(first[0], RouterAction::Relay { .. }));

        // The same id arriving again via a different relayer: dropped,
        // exactly one relay emission total.
        let relayed = packet.relay_copy(&node("BBBB2222"));
        assert!(r.receive(&wire(&relayed)).is_empty());
        assert_eq!(r.stats().relayed.get(), 1);
    }

    // ── Relay decision ─────────────────────────────────────────────────

    #[test]
    fn foreign_message_is_relayed_with_decremented_ttl() {
        let mut r = router("BBBB2222");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "pass it on".into(), 10);

        let actions = r.receive(&wire(&packet));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RouterAction::Relay { packet: copy } => {
                assert_eq!(copy.ttl, 9);
                assert_eq!(copy.hops, vec![node("AAAA1111"), node("BBBB2222")]);
                assert_eq!(copy.sender_id, node("BBBB2222"));
                assert_eq!(copy.original_sender_id, node("AAAA1111"));
                assert!(copy.verify());
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn ttl_zero_delivered_but_never_relayed() {
        let mut r = router("CCCC3333");
        let mut packet = Packet::message(&node("AAAA1111"), NodeId::wildcard(), "last hop".into(), 10);
        packet.ttl = 0;
        packet.seal();

        let actions = r.receive(&wire(&packet));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], RouterAction::Deliver { .. }));
        assert_eq!(r.stats().relayed.get(), 0);
    }

    #[test]
    fn packet_already_carrying_us_is_not_relayed() {
        let mut r = router("BBBB2222");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "loop".into(), 10);
        let looped = packet.relay_copy(&node("BBBB2222")); // we already relayed it once

        assert!(r.receive(&wire(&looped)).is_empty());
    }

    #[test]
    fn own_packet_coming_back_is_not_relayed() {
        let mut r = router("AAAA1111");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "mine".into(), 10);
        assert!(r.receive(&wire(&packet)).is_empty());
    }

    // ── Integrity ──────────────────────────────────────────────────────

    #[test]
    fn digest_mismatch_drops_silently_without_touching_seen() {
        let mut r = router("CCCC3333");
        let mut packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "tampered".into(), 10);
        packet.payload = "swapped".into(); // digest now stale

        assert!(r.receive(&wire(&packet)).is_empty());
        assert_eq!(r.stats().dropped_bad_digest.get(), 1);
        assert_eq!(r.seen_len(), 0, "failed packets must not enter the seen-set");

        // The intact original is still accepted afterwards.
        packet.seal();
        assert_eq!(r.receive(&wire(&packet)).len(), 1);
    }

    #[test]
    fn oversize_ingress_rejected() {
        let mut r = router("CCCC3333");
        let packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "x".repeat(600), 10);
        assert!(r.receive(&wire(&packet)).is_empty());
        assert_eq!(r.stats().dropped_oversize.get(), 1);
    }

    // ── ACK handling ───────────────────────────────────────────────────

    #[test]
    fn ack_for_us_confirms_message() {
        let mut r = router("AAAA1111");
        let ack = Packet::ack(&node("CCCC3333"), node("AAAA1111"), "some-packet-id", 10);

        let actions = r.receive(&wire(&ack));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RouterAction::AckConfirmed { message_id } => {
                assert_eq!(message_id, "some-packet-id");
            }
            other => panic!("expected AckConfirmed, got {other:?}"),
        }
    }

    #[test]
    fn foreign_ack_is_relayed_not_confirmed() {
        let mut r = router("BBBB2222");
        let ack = Packet::ack(&node("CCCC3333"), node("AAAA1111"), "some-packet-id", 10);

        let actions = r.receive(&wire(&ack));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], RouterAction::Relay { .. }));
    }

    // ── Presence ingress ───────────────────────────────────────────────

    #[test]
    fn announce_becomes_observation_of_origin() {
        let mut r = router("CCCC3333");
        let description =
            SelfDescription::new("alice".into(), DeviceType::Phone, "weft".into());
        let packet = Packet::announce(&node("AAAA1111"), description.to_payload(), 10);
        let relayed = packet.relay_copy(&node("BBBB2222"));

        let actions = r.receive(&wire(&relayed));
        match &actions[0] {
            RouterAction::Observation {
                observation,
                packet_type,
            } => {
                // Observation describes the origin, not the relayer.
                assert_eq!(observation.id, node("AAAA1111"));
                assert_eq!(observation.name.as_deref(), Some("alice"));
                assert_eq!(observation.device_type, Some(DeviceType::Phone));
                assert_eq!(*packet_type, PacketType::Announce);
            }
            other => panic!("expected Observation, got {other:?}"),
        }
    }

    #[test]
    fn announce_with_opaque_payload_still_observes() {
        let mut r = router("CCCC3333");
        let packet = Packet::announce(&node("AAAA1111"), "???".into(), 10);
        let actions = r.receive(&wire(&packet));
        match &actions[0] {
            RouterAction::Observation { observation, .. } => {
                assert_eq!(observation.id, node("AAAA1111"));
                assert!(observation.name.is_none());
            }
            other => panic!("expected Observation, got {other:?}"),
        }
    }

    #[test]
    fn ping_refreshes_or_reports_typing() {
        let mut r = router("CCCC3333");

        let ping = Packet::ping(&node("AAAA1111"), node("CCCC3333"), String::new(), 10);
        match &r.receive(&wire(&ping))[0] {
            RouterAction::Refresh { peer } => assert_eq!(*peer, node("AAAA1111")),
            other => panic!("expected Refresh, got {other:?}"),
        }

        let typing = Packet::ping(
            &node("AAAA1111"),
            node("CCCC3333"),
            "{\"isTyping\":true}".into(),
            10,
        );
        match &r.receive(&wire(&typing))[0] {
            RouterAction::Typing { peer, is_typing } => {
                assert_eq!(*peer, node("AAAA1111"));
                assert!(is_typing);
            }
            other => panic!("expected Typing, got {other:?}"),
        }
    }

    // ── RELAY packet type compatibility ────────────────────────────────

    #[test]
    fn relay_tagged_packet_handled_like_message() {
        let mut r = router("CCCC3333");
        let mut packet = Packet::message(&node("AAAA1111"), node("CCCC3333"), "retagged".into(), 10);
        packet.packet_type = PacketType::Relay;
        packet.seal();

        let actions = r.receive(&wire(&packet));
        assert!(matches!(actions[0], RouterAction::Deliver { .. }));
    }
}
