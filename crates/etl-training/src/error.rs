use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("narrative or source_key must not be empty")]
    EmptyContent,

    #[error(transparent)]
    Storage(#[from] etl_storage::ObjectStoreError),

    #[error(transparent)]
    Dedup(#[from] etl_dedup::DedupError),
}

impl TrainingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrainingError::EmptyContent => ErrorKind::Validation,
            TrainingError::Storage(e) => e.kind(),
            TrainingError::Dedup(e) => e.kind(),
        }
    }
}
