use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("declared size {declared} exceeds max_size_bytes {max}")]
    SizeExceeded { declared: u64, max: u64 },

    #[error("network error: {0}")]
    Network(String),
}

impl ObjectStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObjectStoreError::NotFound(_) => ErrorKind::NotFound,
            ObjectStoreError::AccessDenied(_) => ErrorKind::Auth,
            ObjectStoreError::RateLimited(_) => ErrorKind::RateLimit,
            ObjectStoreError::Connection(_) | ObjectStoreError::Network(_) => ErrorKind::Network,
            ObjectStoreError::Timeout(_) => ErrorKind::Timeout,
            ObjectStoreError::SizeExceeded { .. } => ErrorKind::Validation,
        }
    }
}
