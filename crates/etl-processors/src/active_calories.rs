use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

use crate::classified_failure;
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

const DAILY_TARGET_CALORIES: f64 = 500.0;

pub struct ActiveCaloriesProcessor;

#[async_trait]
impl ClinicalProcessor for ActiveCaloriesProcessor {
    fn record_type(&self) -> &'static str {
        "ActiveCaloriesBurnedRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let calorie_records = extract_calorie_records(records);
        if calorie_records.is_empty() {
            return classified_failure(envelope, "no valid calorie records found");
        }

        let daily_calories = aggregate_daily(&calorie_records);
        let metrics = calculate_metrics(&daily_calories);
        let narrative = generate_narrative(&metrics);

        info!(
            records_processed = records.len(),
            days = daily_calories.len(),
            quality_score = validation.quality_score,
            "active calories processing complete"
        );

        let clinical_insights = json!({
            "record_type": "ActiveCaloriesBurnedRecord",
            "total_records": calorie_records.len(),
            "daily_calories": daily_calories.iter().map(|(d, c)| (d.to_string(), round_whole(*c))).collect::<BTreeMap<_, _>>(),
            "metrics": {
                "total_days": metrics.total_days,
                "avg_daily_calories": metrics.avg_daily_calories,
                "max_daily_calories": metrics.max_daily_calories,
                "min_daily_calories": metrics.min_daily_calories,
                "days_meeting_target": metrics.days_meeting_target,
                "total_calories": metrics.total_calories,
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

struct CalorieRecord {
    calories: f64,
    start_date: NaiveDate,
}

fn extract_calorie_records(records: &[Value]) -> Vec<CalorieRecord> {
    records
        .iter()
        .filter_map(|record| {
            let energy = record.get("energy")?;
            let calories = energy
                .get("inCalories")
                .and_then(Value::as_f64)
                .or_else(|| energy.get("inKilocalories").and_then(Value::as_f64))?;
            if calories <= 0.0 {
                return None;
            }
            let start_millis = record.get("startTime")?.get("epochMillis")?.as_i64()?;
            let end_present = record.get("endTime").and_then(|t| t.get("epochMillis")).is_some();
            if !end_present {
                return None;
            }
            let start_time: DateTime<Utc> = DateTime::from_timestamp_millis(start_millis)?;
            Some(CalorieRecord {
                calories,
                start_date: start_time.date_naive(),
            })
        })
        .collect()
}

fn aggregate_daily(records: &[CalorieRecord]) -> BTreeMap<NaiveDate, f64> {
    let mut totals = BTreeMap::new();
    for r in records {
        *totals.entry(r.start_date).or_insert(0.0) += r.calories;
    }
    totals
}

struct Metrics {
    total_days: usize,
    avg_daily_calories: f64,
    max_daily_calories: f64,
    min_daily_calories: f64,
    days_meeting_target: usize,
    total_calories: f64,
}

fn round_whole(v: f64) -> f64 {
    v.round()
}

fn calculate_metrics(daily_calories: &BTreeMap<NaiveDate, f64>) -> Metrics {
    let values: Vec<f64> = daily_calories.values().copied().collect();
    let total_calories = values.iter().sum::<f64>();

    Metrics {
        total_days: values.len(),
        avg_daily_calories: round_whole(etl_common::stats::mean(&values)),
        max_daily_calories: round_whole(etl_common::stats::max_f64(&values)),
        min_daily_calories: round_whole(etl_common::stats::min_f64(&values)),
        days_meeting_target: values.iter().filter(|&&c| c >= DAILY_TARGET_CALORIES).count(),
        total_calories: round_whole(total_calories),
    }
}

fn generate_narrative(metrics: &Metrics) -> String {
    let mut parts = Vec::new();
    let avg = metrics.avg_daily_calories;

    parts.push(format!(
        "Active calorie burn data shows {} day(s) with average of {avg} active calories burned per day.",
        metrics.total_days
    ));

    let activity_text = if avg >= 600.0 {
        format!("Activity level is very high ({avg} cal/day), indicating intensive exercise routine.")
    } else if avg >= 400.0 {
        format!("Activity level is good ({avg} cal/day), meeting moderate exercise recommendations.")
    } else if avg >= 200.0 {
        format!("Activity level is moderate ({avg} cal/day). Consider increasing to 400-600 calories for optimal fitness.")
    } else {
        format!("Activity level is low ({avg} cal/day). Aim for 300-600 active calories daily through exercise.")
    };
    parts.push(activity_text);

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
            record_type: "ActiveCaloriesBurnedRecord".into(),
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

    fn calorie_record(calories: f64, start_millis: i64) -> Value {
        json!({
            "energy": {"inCalories": calories},
            "startTime": {"epochMillis": start_millis},
            "endTime": {"epochMillis": start_millis + 3_600_000},
        })
    }

    #[tokio::test]
    async fn high_calorie_burn_is_flagged_very_high() {
        let processor = ActiveCaloriesProcessor;
        let base = 1_700_000_000_000i64;
        let records: Vec<Value> = (0..3).map(|i| calorie_record(700.0, base + i * 86_400_000)).collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert!(result.narrative.unwrap().contains("very high"));
    }

    #[tokio::test]
    async fn no_records_is_a_classified_failure() {
        let processor = ActiveCaloriesProcessor;
        let result = processor
            .process(&[json!({})], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }
}
