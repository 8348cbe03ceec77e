use crate::types::{NodeId, TransportKind};

/// Errors returned by the transport drivers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {kind} socket: {source}")]
    Bind {
        kind: TransportKind,
        #[source]
        source: std::io::Error,
    },

    #[error("driver not started")]
    NotStarted,

    #[error("peer {0} is not reachable on this transport")]
    PeerUnknown(NodeId),

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: NodeId,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("frame codec error: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("send queue overflow")]
    QueueOverflow,

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid transport kind: {0}")]
    InvalidTransportKind(String),

    #[error("driver shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_peer_unknown() {
        let err = TransportError::PeerUnknown("ABCD1234".parse().unwrap());
        assert_eq!(
            err.to_string(),
            "peer ABCD1234 is not reachable on this transport"
        );
    }

    #[test]
    fn display_bind() {
        let err = TransportError::Bind {
            kind: TransportKind::Lan,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().starts_with("failed to bind lan socket"));
    }
}
