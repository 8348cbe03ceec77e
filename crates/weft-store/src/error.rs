/// Errors surfaced by the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}
