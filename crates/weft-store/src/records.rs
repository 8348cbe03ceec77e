use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use weft_transport::{NodeId, TransportKind};

use crate::error::StoreError;

/// Canonical conversation key for a pair of participants: the two ids
/// sorted lexicographically and joined with `:`. Both directions of a
/// conversation map to the same key.
pub fn conversation_key(a: &NodeId, b: &NodeId) -> String {
    if a.as_str() <= b.as_str() {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Delivery status pipeline for a user message.
///
/// Forward progression: sending → sent → delivered. `queued` parks a
/// message while every transport is down; `failed` is terminal after
/// the retry budget; `read` is reserved for application-level
/// receipts — the core never produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Queued,
}

impl MessageStatus {
    /// Position in the forward pipeline; `queued` sits between
    /// `sending` and `sent` (a queued message has not left the node).
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Queued => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
            MessageStatus::Failed => 5,
        }
    }

    /// No further transport activity happens for these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Queued => "queued",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            "queued" => Ok(MessageStatus::Queued),
            other => Err(StoreError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Rough device class, for display and peer list grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Laptop,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Laptop => "laptop",
            DeviceType::Desktop => "desktop",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Parse a wire/DB value, treating anything unrecognized as
    /// `Unknown` — remote nodes may speak newer vocabularies.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "laptop" => DeviceType::Laptop,
            "desktop" => DeviceType::Desktop,
            _ => DeviceType::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged view of a remote device (or ourselves, with `is_self`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: NodeId,
    pub name: String,
    /// 0–100 heuristic.
    pub signal_strength: u8,
    /// Metres, heuristic; visualization only.
    pub distance: f64,
    /// 0–360, visualization only.
    pub angle: f64,
    /// A transport currently reports an active channel.
    pub is_connected: bool,
    /// Seen within the liveness window.
    pub is_online: bool,
    /// Unix ms of the most recent observation.
    pub last_seen: u64,
    pub device_type: DeviceType,
    /// Transport that reported this device most recently.
    pub connection_type: TransportKind,
    pub is_self: bool,
    pub is_typing: bool,
}

impl DeviceRecord {
    /// Fresh record for a first observation.
    pub fn observed(id: NodeId, connection_type: TransportKind, last_seen: u64) -> Self {
        Self {
            name: format!("MeshUser-{}", id.as_str()),
            id,
            signal_strength: 50,
            distance: 0.0,
            angle: 0.0,
            is_connected: true,
            is_online: true,
            last_seen,
            device_type: DeviceType::Unknown,
            connection_type,
            is_self: false,
            is_typing: false,
        }
    }
}

/// A user message as persisted and as handed to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Equals the originating packet's id.
    pub id: String,
    pub content: String,
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    /// Origin wall time, Unix ms.
    pub timestamp: u64,
    /// Final delivered hop list, origin first.
    pub hops: Vec<NodeId>,
    pub status: MessageStatus,
    pub retry_count: u32,
}

impl Message {
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.sender_id, &self.receiver_id)
    }
}

/// Entry in the durable pending-retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    /// Message (and packet) id.
    pub id: String,
    pub message: Message,
    pub retries: u32,
    /// Unix ms of the most recent emission attempt.
    pub last_attempt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn conversation_key_is_order_independent() {
        let a = node("AAAA1111");
        let b = node("BBBB2222");
        assert_eq!(conversation_key(&a, &b), conversation_key(&b, &a));
        assert_eq!(conversation_key(&a, &b), "AAAA1111:BBBB2222");
    }

    #[test]
    fn conversation_key_with_self() {
        let a = node("AAAA1111");
        assert_eq!(conversation_key(&a, &a), "AAAA1111:AAAA1111");
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
            MessageStatus::Queued,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn status_pipeline_ordering() {
        assert!(MessageStatus::Sending.rank() < MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Queued.rank() < MessageStatus::Sent.rank());
    }

    #[test]
    fn device_type_lossy_parse() {
        assert_eq!(DeviceType::parse_lossy("phone"), DeviceType::Phone);
        assert_eq!(DeviceType::parse_lossy("smartwatch"), DeviceType::Unknown);
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = Message {
            id: "m1".into(),
            content: "hi".into(),
            sender_id: node("AAAA1111"),
            receiver_id: node("BBBB2222"),
            timestamp: 1_700_000_000_000,
            hops: vec![node("AAAA1111")],
            status: MessageStatus::Sending,
            retry_count: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"senderId\""), "{json}");
        assert!(json.contains("\"retryCount\""), "{json}");
        assert!(json.contains("\"status\":\"sending\""), "{json}");
    }
}
