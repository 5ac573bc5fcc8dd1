pub mod config;
pub mod error;
pub mod stats;
pub mod types;

pub use config::{DedupStoreKind, EngineConfig};
pub use error::{Action, ErrorKind, RetryPolicy};
pub use types::{
    health_domain_for_record_type, ClinicalResult, HealthDomain, ProcessingEnvelope,
    ProcessingRecord, ProcessingStatus, TrainingExample, NARRATIVE_PREVIEW_MAX_LENGTH,
    SUPPORTED_RECORD_TYPES,
};
