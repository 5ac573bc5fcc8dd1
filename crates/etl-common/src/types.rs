use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound message as received on the broker, parsed from the JSON envelope
/// described by the upload service (see `ProcessingEnvelope` in the
/// external-interfaces section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEnvelope {
    pub message_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub record_type: String,
    #[serde(rename = "key")]
    pub object_key: String,
    pub bucket: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default, rename = "upload_timestamp_utc")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl ProcessingEnvelope {
    /// Validates that every field required by .2 is present and non-empty.
    pub fn validate_required_fields(&self) -> Result<(), String> {
        if self.message_id.trim().is_empty() {
            return Err("message_id is required".to_string());
        }
        if self.correlation_id.trim().is_empty() {
            return Err("correlation_id is required".to_string());
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id is required".to_string());
        }
        if self.bucket.trim().is_empty() {
            return Err("bucket is required".to_string());
        }
        if self.object_key.trim().is_empty() {
            return Err("key is required".to_string());
        }
        if self.record_type.trim().is_empty() {
            return Err("record_type is required".to_string());
        }
        if self.idempotency_key.trim().is_empty() {
            return Err("idempotency_key is required".to_string());
        }
        Ok(())
    }

    pub fn routing_key_or_default(&self) -> String {
        self.routing_key
            .clone()
            .unwrap_or_else(|| format!("health.processing.{}", self.record_type))
    }
}

/// Terminal/in-progress status of a `ProcessingRecord` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Started,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Started => "started",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ProcessingStatus::Started),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status: {other}")),
        }
    }
}

/// The deduplication-store row keyed by `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub idempotency_key: String,
    pub message_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub record_type: String,
    pub object_key: String,
    pub status: ProcessingStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_seconds: Option<f64>,
    pub records_processed: Option<u64>,
    pub quality_score: Option<f64>,
    pub narrative_preview: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub const NARRATIVE_PREVIEW_MAX_LENGTH: usize = 200;

impl ProcessingRecord {
    pub fn truncate_preview(narrative: &str) -> String {
        if narrative.chars().count() <= NARRATIVE_PREVIEW_MAX_LENGTH {
            narrative.to_string()
        } else {
            narrative.chars().take(NARRATIVE_PREVIEW_MAX_LENGTH).collect()
        }
    }
}

/// Output of a clinical processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalResult {
    pub success: bool,
    pub narrative: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_seconds: f64,
    pub records_processed: u64,
    pub quality_score: f64,
    pub clinical_insights: Value,
}

impl ClinicalResult {
    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            narrative: None,
            error_message: Some(error_message.into()),
            processing_time_seconds: 0.0,
            records_processed: 0,
            quality_score: 0.0,
            clinical_insights: Value::Null,
        }
    }
}

/// A single append-only training line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    pub input: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Closed set of training-output groupings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthDomain {
    MetabolicDiabetes,
    CardiovascularFitness,
    SleepWellness,
    PhysicalActivity,
    GeneralHealth,
}

impl HealthDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthDomain::MetabolicDiabetes => "metabolic_diabetes",
            HealthDomain::CardiovascularFitness => "cardiovascular_fitness",
            HealthDomain::SleepWellness => "sleep_wellness",
            HealthDomain::PhysicalActivity => "physical_activity",
            HealthDomain::GeneralHealth => "general_health",
        }
    }
}

/// The six supported record types and their domain mapping.
///
/// Unlike the processor factory (closed, fatal on unknown types), this
/// mapping falls back to `general_health` for anything unrecognized — the
/// training formatter is reachable from scenarios where the record type is
/// already known-good but not one of the six.
pub fn health_domain_for_record_type(record_type: &str) -> HealthDomain {
    match record_type {
        "BloodGlucoseRecord" => HealthDomain::MetabolicDiabetes,
        "HeartRateRecord" => HealthDomain::CardiovascularFitness,
        "SleepSessionRecord" => HealthDomain::SleepWellness,
        "StepsRecord" => HealthDomain::PhysicalActivity,
        "ActiveCaloriesBurnedRecord" => HealthDomain::PhysicalActivity,
        "HeartRateVariabilityRmssdRecord" => HealthDomain::CardiovascularFitness,
        _ => HealthDomain::GeneralHealth,
    }
}

/// The six record types the clinical-processor factory supports.
/// Anything outside this set is a fatal `processing` error at C5.
pub const SUPPORTED_RECORD_TYPES: &[&str] = &[
    "BloodGlucoseRecord",
    "HeartRateRecord",
    "SleepSessionRecord",
    "StepsRecord",
    "ActiveCaloriesBurnedRecord",
    "HeartRateVariabilityRmssdRecord",
];
