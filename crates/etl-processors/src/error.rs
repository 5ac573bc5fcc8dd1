use etl_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("unsupported record type: {0}")]
    UnsupportedRecordType(String),
}

impl ProcessorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessorError::UnsupportedRecordType(_) => ErrorKind::Processing,
        }
    }
}
