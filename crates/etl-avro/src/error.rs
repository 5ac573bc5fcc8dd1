use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum AvroError {
    #[error("unreadable avro container: {0}")]
    Schema(String),

    #[error("record type mismatch: {0}")]
    Validation(String),
}

impl AvroError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AvroError::Schema(_) => ErrorKind::Schema,
            AvroError::Validation(_) => ErrorKind::Validation,
        }
    }
}
