use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("envelope parse error: {0}")]
    EnvelopeParse(String),

    #[error(transparent)]
    Storage(#[from] etl_storage::ObjectStoreError),

    #[error(transparent)]
    Avro(#[from] etl_avro::AvroError),

    #[error(transparent)]
    Dedup(#[from] etl_dedup::DedupError),

    #[error(transparent)]
    Processor(#[from] etl_processors::error::ProcessorError),

    #[error(transparent)]
    Training(#[from] etl_training::TrainingError),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("processing deadline exceeded")]
    Timeout,

    #[error("broker error: {0}")]
    Broker(String),
}

impl ConsumerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::EnvelopeParse(_) => ErrorKind::Validation,
            ConsumerError::Storage(e) => e.kind(),
            ConsumerError::Avro(e) => e.kind(),
            ConsumerError::Dedup(e) => e.kind(),
            ConsumerError::Processor(e) => e.kind(),
            ConsumerError::Training(e) => e.kind(),
            ConsumerError::Processing(_) => ErrorKind::Processing,
            ConsumerError::Timeout => ErrorKind::Timeout,
            ConsumerError::Broker(_) => ErrorKind::Network,
        }
    }
}
