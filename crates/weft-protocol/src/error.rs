/// Errors surfaced by the mesh core.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: String },

    #[error("no transport available")]
    TransportUnavailable,

    #[error("durable store error: {0}")]
    Store(#[from] weft_store::StoreError),

    #[error("cannot establish a stable node identity: {0}")]
    IdentityUnavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] weft_transport::TransportError),

    #[error("runtime shut down")]
    Shutdown,
}

impl WeftError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        WeftError::MalformedPacket {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(e: serde_json::Error) -> Self {
        WeftError::MalformedPacket {
            reason: e.to_string(),
        }
    }
}
