use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("deduplication store used before initialize()")]
    StoreUninitialized,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl DedupError {
    /// All store-level errors bubble up as infrastructure (retriable)
    /// failures at the consumer, except calling the store before it has
    /// been initialized, which is a programming error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::StoreUninitialized => ErrorKind::Processing,
            DedupError::InvalidRecord(_) => ErrorKind::Validation,
            DedupError::Sqlite(_) | DedupError::Redis(_) | DedupError::Serialization(_) => {
                ErrorKind::Network
            }
        }
    }
}
