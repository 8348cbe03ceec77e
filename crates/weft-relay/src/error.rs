use weft_transport::NodeId;

/// Errors from the relay server and client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("connection to relay {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay connection lost")]
    Disconnected,

    #[error("frame codec error: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("protocol violation from {device_id}: {reason}")]
    Protocol { device_id: NodeId, reason: String },

    #[error("request timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_protocol() {
        let err = RelayError::Protocol {
            device_id: "AAAA1111".parse().unwrap(),
            reason: "data before hello".into(),
        };
        assert_eq!(
            err.to_string(),
            "protocol violation from AAAA1111: data before hello"
        );
    }
}
