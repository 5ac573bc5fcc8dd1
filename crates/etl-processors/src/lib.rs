mod active_calories;
mod blood_glucose;
mod common;
pub mod error;
mod heart_rate;
mod hrv;
mod sleep;
mod steps;
pub mod validation;

use async_trait::async_trait;
use etl_common::{ClinicalResult, ErrorKind, ProcessingEnvelope, SUPPORTED_RECORD_TYPES};
use serde_json::Value;
use validation::ValidationResult;

/// A single clinical domain's extract -> analyze -> render pipeline.
///
/// Implementors own their own classification tables and pattern rules;
/// this trait only fixes the shape every domain is driven through.
#[async_trait]
pub trait ClinicalProcessor: Send + Sync {
    /// Record type this processor handles, e.g. `"BloodGlucoseRecord"`.
    fn record_type(&self) -> &'static str;

    /// Called once per processor instance before the first `process` call.
    /// Most processors have nothing to set up; a few warm lookup tables.
    async fn initialize(&self) {}

    /// Run the domain pipeline over the decoded Avro records belonging to
    /// one envelope, producing a narrative and structured insights.
    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult;

    async fn cleanup(&self) {}
}

/// Resolves a record type to its processor. Built once at startup as a
/// static registry rather than a factory-of-instances: every supported
/// domain is a zero-state struct, so there is nothing to pool or recycle.
/// Unknown record types are a classified `Processing` error, not a
/// silently-tolerated no-op.
///
/// Matches the wire-format record type names in `SUPPORTED_RECORD_TYPES`
/// (`"BloodGlucoseRecord"`, not `"blood_glucose"`) — the same names
/// `ProcessingEnvelope.record_type` carries end to end.
pub fn resolve(record_type: &str) -> Result<Box<dyn ClinicalProcessor>, error::ProcessorError> {
    if !SUPPORTED_RECORD_TYPES.contains(&record_type) {
        return Err(error::ProcessorError::UnsupportedRecordType(record_type.to_string()));
    }
    match record_type {
        "BloodGlucoseRecord" => Ok(Box::new(blood_glucose::BloodGlucoseProcessor)),
        "HeartRateRecord" => Ok(Box::new(heart_rate::HeartRateProcessor)),
        "SleepSessionRecord" => Ok(Box::new(sleep::SleepProcessor)),
        "StepsRecord" => Ok(Box::new(steps::StepsProcessor)),
        "ActiveCaloriesBurnedRecord" => Ok(Box::new(active_calories::ActiveCaloriesProcessor)),
        "HeartRateVariabilityRmssdRecord" => Ok(Box::new(hrv::HrvProcessor)),
        other => Err(error::ProcessorError::UnsupportedRecordType(other.to_string())),
    }
}

pub(crate) fn classified_failure(envelope: &ProcessingEnvelope, message: impl Into<String>) -> ClinicalResult {
    ClinicalResult::failure(envelope.message_id.clone(), ErrorKind::Processing, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_record_type_resolves() {
        for record_type in SUPPORTED_RECORD_TYPES {
            let processor = resolve(record_type).unwrap_or_else(|e| panic!("{record_type} failed to resolve: {e}"));
            assert_eq!(processor.record_type(), *record_type);
        }
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let err = resolve("UnknownRecord").unwrap_err();
        assert!(matches!(err, error::ProcessorError::UnsupportedRecordType(_)));
    }

    #[test]
    fn snake_case_alias_no_longer_resolves() {
        assert!(resolve("blood_glucose").is_err());
    }
}
