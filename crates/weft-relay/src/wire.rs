//! Relay wire protocol: newline-delimited JSON frames, camelCase
//! fields, tagged by `type`. Payloads forwarded between peers stay
//! opaque byte sequences.

use serde::{Deserialize, Serialize};
use weft_transport::{NodeId, SignalBlob};

/// Device row in the relay's record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub device_id: NodeId,
    pub device_name: String,
    pub device_type: String,
    pub is_online: bool,
    /// Unix ms.
    pub last_seen: u64,
}

/// Store-and-forward message row, keyed by `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    pub content: String,
    pub status: String,
    pub hops: Vec<NodeId>,
    /// Unix ms.
    pub created_at: u64,
}

/// Presence row, keyed by device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub is_online: bool,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_to: Option<NodeId>,
    /// Unix ms.
    pub last_heartbeat: u64,
}

/// Frames the client sends. `Hello` must come first on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Hello { device: DeviceEntry },
    /// Idempotent presence upsert.
    Presence { presence: PresenceRecord },
    /// Idempotent store-and-forward upsert.
    StoreMessage { record: MessageRecord },
    /// Ask for undelivered records addressed to this device.
    FetchInbox,
    /// Flag a stored record as delivered (after local admission).
    MarkDelivered { message_id: String },
    /// Pass a signaling blob to another connected device.
    Signal { to: NodeId, blob: SignalBlob },
    /// Live forward to one peer (relay-as-transport).
    Forward { to: NodeId, payload: Vec<u8> },
    /// Live fan-out to every other connected peer.
    Broadcast { payload: Vec<u8> },
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Answer to `Hello`: the currently online devices.
    Welcome { devices: Vec<DeviceEntry> },
    PeerOnline { device: DeviceEntry },
    PeerOffline { device_id: NodeId },
    /// Answer to `FetchInbox`.
    Inbox { records: Vec<MessageRecord> },
    Signal { from: NodeId, blob: SignalBlob },
    /// Live payload from another peer.
    Deliver { from: NodeId, payload: Vec<u8> },
}

/// Encode one frame as a JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn client_frame_roundtrip() {
        let frame = ClientFrame::Forward {
            to: node("BBBB2222"),
            payload: vec![1, 2, 3],
        };
        let line = encode_line(&frame).unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');
        let decoded: ClientFrame = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn frames_are_type_tagged_camel_case() {
        let frame = ClientFrame::FetchInbox;
        let json = String::from_utf8(encode_line(&frame).unwrap()).unwrap();
        assert!(json.contains("\"type\":\"fetchInbox\""), "{json}");

        let frame = ServerFrame::PeerOffline {
            device_id: node("AAAA1111"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"peerOffline\""), "{json}");
        assert!(json.contains("\"deviceId\""), "{json}");
    }

    #[test]
    fn message_record_field_names() {
        let record = MessageRecord {
            message_id: "m1".into(),
            sender_id: node("AAAA1111"),
            receiver_id: node("BBBB2222"),
            content: "hello".into(),
            status: "sent".into(),
            hops: vec![node("AAAA1111")],
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        for field in ["messageId", "senderId", "receiverId", "createdAt"] {
            assert!(json.contains(field), "missing {field}: {json}");
        }
    }

    #[test]
    fn presence_typing_to_omitted_when_none() {
        let presence = PresenceRecord {
            is_online: true,
            is_typing: false,
            typing_to: None,
            last_heartbeat: 0,
        };
        let json = serde_json::to_string(&presence).unwrap();
        assert!(!json.contains("typingTo"), "{json}");
    }
}
