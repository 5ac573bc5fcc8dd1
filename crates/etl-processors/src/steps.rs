use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

use crate::classified_failure;
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

const DAILY_TARGET: u64 = 10_000;

pub struct StepsProcessor;

#[async_trait]
impl ClinicalProcessor for StepsProcessor {
    fn record_type(&self) -> &'static str {
        "StepsRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let step_records = extract_step_records(records);
        if step_records.is_empty() {
            return classified_failure(envelope, "no valid step records found");
        }

        let daily_steps = aggregate_daily(&step_records);
        let metrics = calculate_metrics(&daily_steps);
        let narrative = generate_narrative(&daily_steps, &metrics);

        info!(
            records_processed = records.len(),
            days = daily_steps.len(),
            quality_score = validation.quality_score,
            "steps processing complete"
        );

        let clinical_insights = json!({
            "record_type": "StepsRecord",
            "total_records": step_records.len(),
            "daily_steps": daily_steps.iter().map(|(d, c)| (d.to_string(), c)).collect::<BTreeMap<_, _>>(),
            "metrics": {
                "total_days": metrics.total_days,
                "avg_daily_steps": metrics.avg_daily_steps,
                "max_daily_steps": metrics.max_daily_steps,
                "min_daily_steps": metrics.min_daily_steps,
                "days_meeting_target": metrics.days_meeting_target,
                "total_steps": metrics.total_steps,
            },
        });

        ClinicalResult {
            success: true,
            narrative: Some(narrative),
            error_message: None,
            processing_time_seconds: 0.0,
            records_processed: records.len() as u64,
            quality_score: validation.quality_score,
            clinical_insights,
        }
    }
}

struct StepRecord {
    count: u64,
    start_date: NaiveDate,
}

fn extract_step_records(records: &[Value]) -> Vec<StepRecord> {
    records
        .iter()
        .filter_map(|record| {
            let count = record.get("count").and_then(Value::as_u64)?;
            if count == 0 {
                return None;
            }
            let start_millis = record.get("startTime")?.get("epochMillis")?.as_i64()?;
            let end_present = record.get("endTime").and_then(|t| t.get("epochMillis")).is_some();
            if !end_present {
                return None;
            }
            let start_time: DateTime<Utc> = DateTime::from_timestamp_millis(start_millis)?;
            Some(StepRecord {
                count,
                start_date: start_time.date_naive(),
            })
        })
        .collect()
}

fn aggregate_daily(records: &[StepRecord]) -> BTreeMap<NaiveDate, u64> {
    let mut totals = BTreeMap::new();
    for r in records {
        *totals.entry(r.start_date).or_insert(0) += r.count;
    }
    totals
}

struct Metrics {
    total_days: usize,
    avg_daily_steps: u64,
    max_daily_steps: u64,
    min_daily_steps: u64,
    days_meeting_target: usize,
    total_steps: u64,
}

fn calculate_metrics(daily_steps: &BTreeMap<NaiveDate, u64>) -> Metrics {
    let values: Vec<u64> = daily_steps.values().copied().collect();
    let total_steps: u64 = values.iter().sum();
    let avg_daily_steps = (total_steps as f64 / values.len() as f64).round() as u64;

    Metrics {
        total_days: values.len(),
        avg_daily_steps,
        max_daily_steps: *values.iter().max().unwrap(),
        min_daily_steps: *values.iter().min().unwrap(),
        days_meeting_target: values.iter().filter(|&&s| s >= DAILY_TARGET).count(),
        total_steps,
    }
}

fn generate_narrative(daily_steps: &BTreeMap<NaiveDate, u64>, metrics: &Metrics) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "Step count data shows {} day(s) with average of {} steps per day.",
        metrics.total_days, metrics.avg_daily_steps
    ));

    let avg = metrics.avg_daily_steps;
    let activity_text = if avg >= 10_000 {
        "Activity level is excellent, meeting WHO recommendation of 10,000 steps daily.".to_string()
    } else if avg >= 7_500 {
        format!("Activity level is good ({avg} steps), approaching recommended 10,000 steps.")
    } else {
        format!("Activity level is below recommended ({avg} steps). Aim for 10,000 steps daily for optimal health.")
    };
    parts.push(activity_text);

    if metrics.total_days >= 7 {
        let target_pct = metrics.days_meeting_target as f64 / metrics.total_days as f64 * 100.0;
        parts.push(format!(
            "{} of {} days ({target_pct:.0}%) met the 10,000-step target.",
            metrics.days_meeting_target, metrics.total_days
        ));
    }

    let _ = daily_steps;
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_common::ProcessingEnvelope;

    fn envelope() -> ProcessingEnvelope {
        ProcessingEnvelope {
            message_id: "m1".into(),
            correlation_id: "c1".into(),
            user_id: "u1".into(),
            record_type: "StepsRecord".into(),
            object_key: "raw/u1/file.avro".into(),
            bucket: "bucket".into(),
            idempotency_key: "idem1".into(),
            content_hash: None,
            file_size_bytes: None,
            record_count: None,
            upload_timestamp: None,
            retry_count: 0,
            routing_key: None,
        }
    }

    fn step_record(count: u64, start_millis: i64) -> Value {
        json!({
            "count": count,
            "startTime": {"epochMillis": start_millis},
            "endTime": {"epochMillis": start_millis + 3_600_000},
        })
    }

    #[tokio::test]
    async fn meeting_target_every_day_is_excellent() {
        let processor = StepsProcessor;
        let base = 1_700_000_000_000i64;
        let records: Vec<Value> = (0..7).map(|i| step_record(12_000, base + i * 86_400_000)).collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert!(result.narrative.unwrap().contains("excellent"));
        assert_eq!(result.clinical_insights["metrics"]["days_meeting_target"], 7);
    }

    #[tokio::test]
    async fn no_records_is_a_classified_failure() {
        let processor = StepsProcessor;
        let result = processor
            .process(&[json!({})], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }
}
