use murmur_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bus error: {0}")]
    Bus(String),
}
