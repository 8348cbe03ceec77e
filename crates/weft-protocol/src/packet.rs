//! Packet codec: the JSON wire format, the 32-bit content digest, and
//! the relay-copy construction.
//!
//! The digest is required bit-exactly for interop with other
//! implementations: `h = ((h << 5) - h) + c` per code point of the
//! canonical form, masked to signed 32-bit, absolute value in
//! lowercase hex padded to 8 chars. The canonical form is the packet
//! serialized without `signature`, fields in construction order.

use serde::{Deserialize, Serialize};

use crate::error::WeftError;
use crate::types::{now_ms, NodeId};

/// Default hop budget for freshly built packets.
pub const DEFAULT_TTL: u8 = 10;

/// Default maximum serialized packet size in bytes.
pub const MAX_PACKET_SIZE: usize = 512;

/// Wire-level packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacketType {
    Discover,
    Announce,
    Message,
    Ack,
    /// Accepted for compatibility with peers that re-tag forwarded
    /// traffic; handled exactly like `Message`. Never emitted.
    Relay,
    Ping,
}

/// The unit of communication between nodes.
///
/// Field order is load-bearing: the canonical form (and therefore the
/// digest) serializes fields in exactly this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Unique id: origin wall time plus a random suffix.
    pub id: String,
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    /// Most recent hop.
    pub sender_id: NodeId,
    /// Origin node.
    pub original_sender_id: NodeId,
    /// Destination node id, or `*` for broadcast.
    pub target_id: NodeId,
    /// UTF-8 payload. For ACK: the acknowledged packet's id. For
    /// DISCOVER/ANNOUNCE: a small self-description document.
    pub payload: String,
    /// Origin wall time, Unix ms.
    pub timestamp: u64,
    /// Hops remaining.
    pub ttl: u8,
    /// Nodes this packet has traversed, originator first.
    pub hops: Vec<NodeId>,
    /// 32-bit content digest, 8-char lowercase hex.
    pub signature: String,
}

/// Canonical view: every field except `signature`, same order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalPacket<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    packet_type: PacketType,
    sender_id: &'a NodeId,
    original_sender_id: &'a NodeId,
    target_id: &'a NodeId,
    payload: &'a str,
    timestamp: u64,
    ttl: u8,
    hops: &'a [NodeId],
}

/// The 32-bit rolling hash over a canonical string.
pub fn content_digest(canonical: &str) -> String {
    let mut h: i32 = 0;
    for c in canonical.chars() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32);
    }
    format!("{:08x}", h.unsigned_abs())
}

/// Generate a packet id: millisecond timestamp plus a random suffix.
pub fn new_packet_id() -> String {
    format!("{}-{:08x}", now_ms(), rand::random::<u32>())
}

impl Packet {
    /// Build and seal a packet originating at `from`.
    pub fn new(
        packet_type: PacketType,
        from: &NodeId,
        target: NodeId,
        payload: String,
        ttl: u8,
    ) -> Self {
        let mut packet = Self {
            id: new_packet_id(),
            packet_type,
            sender_id: from.clone(),
            original_sender_id: from.clone(),
            target_id: target,
            payload,
            timestamp: now_ms(),
            ttl,
            hops: vec![from.clone()],
            signature: String::new(),
        };
        packet.seal();
        packet
    }

    /// A user MESSAGE from `from` to `to`.
    pub fn message(from: &NodeId, to: NodeId, content: String, ttl: u8) -> Self {
        Self::new(PacketType::Message, from, to, content, ttl)
    }

    /// An ACK back toward `origin` for the packet `acked_id`. Fresh TTL.
    pub fn ack(from: &NodeId, origin: NodeId, acked_id: &str, ttl: u8) -> Self {
        Self::new(PacketType::Ack, from, origin, acked_id.to_string(), ttl)
    }

    /// An ANNOUNCE to the wildcard target.
    pub fn announce(from: &NodeId, self_description: String, ttl: u8) -> Self {
        Self::new(
            PacketType::Announce,
            from,
            NodeId::wildcard(),
            self_description,
            ttl,
        )
    }

    /// A DISCOVER probe to the wildcard target.
    pub fn discover(from: &NodeId, self_description: String, ttl: u8) -> Self {
        Self::new(
            PacketType::Discover,
            from,
            NodeId::wildcard(),
            self_description,
            ttl,
        )
    }

    /// A PING keepalive to one peer.
    pub fn ping(from: &NodeId, to: NodeId, payload: String, ttl: u8) -> Self {
        Self::new(PacketType::Ping, from, to, payload, ttl)
    }

    /// Reconstruct the wire packet for a locally stored message, e.g.
    /// when re-emitting from the durable pending queue after a restart.
    /// Keeps the original id and timestamp so duplicate suppression
    /// and ACK correlation still line up.
    pub fn rebuild_message(
        id: String,
        sender: &NodeId,
        receiver: NodeId,
        content: String,
        timestamp: u64,
        ttl: u8,
    ) -> Self {
        let mut packet = Self {
            id,
            packet_type: PacketType::Message,
            sender_id: sender.clone(),
            original_sender_id: sender.clone(),
            target_id: receiver,
            payload: content,
            timestamp,
            ttl,
            hops: vec![sender.clone()],
            signature: String::new(),
        };
        packet.seal();
        packet
    }

    /// The canonical string the digest is computed over.
    pub fn canonical_string(&self) -> String {
        let canonical = CanonicalPacket {
            id: &self.id,
            packet_type: self.packet_type,
            sender_id: &self.sender_id,
            original_sender_id: &self.original_sender_id,
            target_id: &self.target_id,
            payload: &self.payload,
            timestamp: self.timestamp,
            ttl: self.ttl,
            hops: &self.hops,
        };
        serde_json::to_string(&canonical).expect("canonical serialization cannot fail")
    }

    /// Recompute and set the digest. Must be called after any field
    /// mutation (relay copies do this).
    pub fn seal(&mut self) {
        self.signature = content_digest(&self.canonical_string());
    }

    /// Recompute the digest and compare with the carried signature.
    pub fn verify(&self) -> bool {
        !self.signature.is_empty() && content_digest(&self.canonical_string()) == self.signature
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, WeftError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a wire packet. Rejects oversize input before parsing and
    /// enforces the structural invariants on `hops`.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, WeftError> {
        if bytes.len() > max_size {
            return Err(WeftError::malformed(format!(
                "packet of {} bytes exceeds maximum {max_size}",
                bytes.len()
            )));
        }
        let packet: Packet = serde_json::from_slice(bytes)?;
        if packet.hops.is_empty() {
            return Err(WeftError::malformed("empty hop list"));
        }
        if packet.hops[0] != packet.original_sender_id {
            return Err(WeftError::malformed("hop list does not start at origin"));
        }
        Ok(packet)
    }

    /// Whether this node should relay the packet onward.
    pub fn should_relay(&self, local_id: &NodeId) -> bool {
        self.ttl > 0
            && self.original_sender_id != *local_id
            && !self.hops.contains(local_id)
            && self.target_id != *local_id
    }

    /// Build the relay copy: this node becomes the sender, TTL drops
    /// by one, the hop list grows, and the digest is recomputed.
    /// Callers must have checked [`should_relay`](Self::should_relay).
    pub fn relay_copy(&self, local_id: &NodeId) -> Self {
        let mut copy = self.clone();
        copy.sender_id = local_id.clone();
        copy.ttl = self.ttl.saturating_sub(1);
        copy.hops.push(local_id.clone());
        copy.seal();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    // ── Digest vectors ─────────────────────────────────────────────────
    // The first three are hand-computed; "hello" matches the classic
    // h*31+c hash; "polygenelubricants" lands exactly on i32::MIN and
    // pins the absolute-value edge case.

    #[test]
    fn digest_known_vectors() {
        assert_eq!(content_digest(""), "00000000");
        assert_eq!(content_digest("a"), "00000061");
        assert_eq!(content_digest("ab"), "00000c21");
        assert_eq!(content_digest("abc"), "00017862");
        assert_eq!(content_digest("hello"), "05e918d2");
        assert_eq!(content_digest("polygenelubricants"), "80000000");
    }

    #[test]
    fn digest_is_lowercase_hex_8() {
        for input in ["", "x", "some longer input with unicode: héllo ✓"] {
            let digest = content_digest(input);
            assert_eq!(digest.len(), 8);
            assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    // ── Wire format ────────────────────────────────────────────────────

    #[test]
    fn wire_field_names_and_order() {
        let packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        let json = String::from_utf8(packet.encode().unwrap()).unwrap();
        let expected_order = [
            "\"id\"",
            "\"type\"",
            "\"senderId\"",
            "\"originalSenderId\"",
            "\"targetId\"",
            "\"payload\"",
            "\"timestamp\"",
            "\"ttl\"",
            "\"hops\"",
            "\"signature\"",
        ];
        let mut last = 0;
        for field in expected_order {
            let pos = json.find(field).unwrap_or_else(|| panic!("missing {field}: {json}"));
            assert!(pos > last || last == 0, "field {field} out of order: {json}");
            last = pos;
        }
        assert!(json.contains("\"type\":\"MESSAGE\""), "{json}");
    }

    #[test]
    fn canonical_form_is_wire_form_minus_signature() {
        let packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        let wire = String::from_utf8(packet.encode().unwrap()).unwrap();
        let canonical = packet.canonical_string();
        let expected = wire.replace(
            &format!(",\"signature\":\"{}\"", packet.signature),
            "",
        );
        assert_eq!(canonical, expected);
    }

    #[test]
    fn encode_decode_roundtrip_preserves_verify() {
        let packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "round trip".into(), 10);
        assert!(packet.verify());
        let bytes = packet.encode().unwrap();
        let decoded = Packet::decode(&bytes, MAX_PACKET_SIZE).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.verify());
    }

    #[test]
    fn packet_type_names_on_wire() {
        for (packet_type, name) in [
            (PacketType::Discover, "DISCOVER"),
            (PacketType::Announce, "ANNOUNCE"),
            (PacketType::Message, "MESSAGE"),
            (PacketType::Ack, "ACK"),
            (PacketType::Relay, "RELAY"),
            (PacketType::Ping, "PING"),
        ] {
            assert_eq!(
                serde_json::to_string(&packet_type).unwrap(),
                format!("\"{name}\"")
            );
        }
    }

    // ── Verification ───────────────────────────────────────────────────

    #[test]
    fn tampering_breaks_verify() {
        let mut packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        packet.payload.push('!');
        assert!(!packet.verify());
        packet.seal();
        assert!(packet.verify());
    }

    #[test]
    fn empty_signature_never_verifies() {
        let mut packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        packet.signature.clear();
        assert!(!packet.verify());
    }

    #[test]
    fn single_bit_flip_on_the_wire_is_rejected_or_fails_verify() {
        let packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "payload".into(), 10);
        let mut bytes = packet.encode().unwrap();
        // Flip a bit inside the payload content.
        let pos = String::from_utf8(bytes.clone())
            .unwrap()
            .find("payload\",")
            .unwrap();
        bytes[pos] ^= 0x01;
        match Packet::decode(&bytes, MAX_PACKET_SIZE) {
            Ok(decoded) => assert!(!decoded.verify()),
            Err(WeftError::MalformedPacket { .. }) => {} // broke the JSON itself
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // ── Decode guards ──────────────────────────────────────────────────

    #[test]
    fn oversize_packet_rejected() {
        let packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "x".repeat(600), 10);
        let bytes = packet.encode().unwrap();
        assert!(matches!(
            Packet::decode(&bytes, MAX_PACKET_SIZE),
            Err(WeftError::MalformedPacket { .. })
        ));
        // A generous limit accepts it.
        assert!(Packet::decode(&bytes, 4096).is_ok());
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            Packet::decode(b"not json at all", MAX_PACKET_SIZE),
            Err(WeftError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn empty_hops_rejected() {
        let mut packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        packet.hops.clear();
        packet.seal();
        let bytes = packet.encode().unwrap();
        assert!(matches!(
            Packet::decode(&bytes, MAX_PACKET_SIZE),
            Err(WeftError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn hops_must_start_at_origin() {
        let mut packet = Packet::message(&node("AAAA1111"), node("BBBB2222"), "hi".into(), 10);
        packet.hops = vec![node("CCCC3333")];
        packet.seal();
        let bytes = packet.encode().unwrap();
        assert!(matches!(
            Packet::decode(&bytes, MAX_PACKET_SIZE),
            Err(WeftError::MalformedPacket { .. })
        ));
    }

    // ── Relay decision and copy ────────────────────────────────────────

    #[test]
    fn relay_decision_matrix() {
        let origin = node("AAAA1111");
        let target = node("BBBB2222");
        let relay = node("CCCC3333");
        let packet = Packet::message(&origin, target.clone(), "hi".into(), 10);

        assert!(packet.should_relay(&relay));
        assert!(!packet.should_relay(&origin)); // we sent it
        assert!(!packet.should_relay(&target)); // it is for us

        let mut expired = packet.clone();
        expired.ttl = 0;
        assert!(!expired.should_relay(&relay));

        let mut looped = packet.clone();
        looped.hops.push(relay.clone());
        assert!(!looped.should_relay(&relay)); // already carried it
    }

    #[test]
    fn wildcard_messages_are_relayed_and_delivered() {
        let origin = node("AAAA1111");
        let relay = node("CCCC3333");
        let packet = Packet::announce(&origin, "{}".into(), 10);
        assert!(packet.target_id.is_wildcard());
        assert!(packet.should_relay(&relay));
    }

    #[test]
    fn relay_copy_rewrites_and_reseals() {
        let origin = node("AAAA1111");
        let relay = node("CCCC3333");
        let packet = Packet::message(&origin, node("BBBB2222"), "hop".into(), 10);
        let copy = packet.relay_copy(&relay);

        assert_eq!(copy.ttl, packet.ttl - 1);
        assert_eq!(copy.sender_id, relay);
        assert_eq!(copy.original_sender_id, origin);
        assert_eq!(copy.hops, vec![origin.clone(), relay.clone()]);
        assert_eq!(copy.id, packet.id);
        assert_ne!(copy.signature, packet.signature);
        assert!(copy.verify());
        assert!(packet.verify(), "original untouched");
    }

    // ── Constructors ───────────────────────────────────────────────────

    #[test]
    fn ack_carries_acked_id_toward_origin() {
        let origin = node("AAAA1111");
        let receiver = node("BBBB2222");
        let message = Packet::message(&origin, receiver.clone(), "hi".into(), 10);
        let ack = Packet::ack(&receiver, origin.clone(), &message.id, 10);

        assert_eq!(ack.packet_type, PacketType::Ack);
        assert_eq!(ack.payload, message.id);
        assert_eq!(ack.target_id, origin);
        assert_eq!(ack.ttl, 10);
        assert_eq!(ack.hops, vec![receiver]);
        assert!(ack.verify());
    }

    #[test]
    fn new_packets_have_origin_invariants() {
        let origin = node("AAAA1111");
        let packet = Packet::ping(&origin, node("BBBB2222"), String::new(), 10);
        assert_eq!(packet.hops.len(), 1);
        assert_eq!(packet.hops[0], origin);
        assert_eq!(packet.sender_id, origin);
        assert_eq!(packet.original_sender_id, origin);
        assert!(packet.id.contains('-'));
    }

    #[test]
    fn rebuild_keeps_id_and_timestamp() {
        let origin = node("AAAA1111");
        let rebuilt = Packet::rebuild_message(
            "1700000000000-00abcdef".into(),
            &origin,
            node("BBBB2222"),
            "queued content".into(),
            1_700_000_000_000,
            10,
        );
        assert_eq!(rebuilt.id, "1700000000000-00abcdef");
        assert_eq!(rebuilt.timestamp, 1_700_000_000_000);
        assert!(rebuilt.verify());
    }
}
