//! Shared type re-exports and small helpers.

pub use weft_store::{
    conversation_key, DeviceRecord, DeviceType, Message, MessageStatus, PendingMessage,
};
pub use weft_transport::{NodeId, PeerDescriptor, SignalBlob, TransportKind};

/// Current wall time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_past_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
