use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use tracing::info;

use crate::classified_failure;
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

pub struct HrvProcessor;

#[async_trait]
impl ClinicalProcessor for HrvProcessor {
    fn record_type(&self) -> &'static str {
        "HeartRateVariabilityRmssdRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let readings = extract_readings(records);
        if readings.is_empty() {
            return classified_failure(envelope, "no valid HRV readings found");
        }

        let metrics = calculate_metrics(&readings);
        let trend = analyze_trend(&readings);
        let narrative = generate_narrative(readings.len(), &metrics, &trend);

        info!(
            records_processed = records.len(),
            readings_extracted = readings.len(),
            quality_score = validation.quality_score,
            "HRV processing complete"
        );

        let clinical_insights = json!({
            "record_type": "HeartRateVariabilityRmssdRecord",
            "total_readings": readings.len(),
            "metrics": {
                "total_readings": metrics.total_readings,
                "avg_hrv_rmssd": metrics.avg_hrv_rmssd,
                "min_hrv": metrics.min_hrv,
                "max_hrv": metrics.max_hrv,
                "std_dev": metrics.std_dev,
                "hrv_category": metrics.hrv_category,
                "recovery_status": metrics.recovery_status,
            },
            "trends": trend.as_ref().map(|t| json!({
                "trend": t.label,
                "change_percent": t.change_percent,
            })),
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

struct Reading {
    rmssd_ms: f64,
    timestamp: DateTime<Utc>,
}

fn extract_readings(records: &[Value]) -> Vec<Reading> {
    let mut readings: Vec<Reading> = records
        .iter()
        .filter_map(|record| {
            let rmssd_ms = record.get("heartRateVariabilityRmssd")?.get("inMilliseconds")?.as_f64()?;
            let epoch_millis = record.get("time")?.get("epochMillis")?.as_i64()?;
            let timestamp = DateTime::from_timestamp_millis(epoch_millis)?;
            Some(Reading { rmssd_ms, timestamp })
        })
        .collect();

    readings.sort_by_key(|r| r.timestamp);
    readings
}

struct Metrics {
    total_readings: usize,
    avg_hrv_rmssd: f64,
    min_hrv: f64,
    max_hrv: f64,
    std_dev: f64,
    hrv_category: &'static str,
    recovery_status: &'static str,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn calculate_metrics(readings: &[Reading]) -> Metrics {
    let values: Vec<f64> = readings.iter().map(|r| r.rmssd_ms).collect();
    let avg_hrv = etl_common::stats::mean(&values);

    let (hrv_category, recovery_status) = if avg_hrv < 20.0 {
        ("very_low", "poor")
    } else if avg_hrv < 40.0 {
        ("low", "below_average")
    } else if avg_hrv < 60.0 {
        ("average", "normal")
    } else if avg_hrv < 80.0 {
        ("good", "good")
    } else {
        ("excellent", "excellent")
    };

    Metrics {
        total_readings: readings.len(),
        avg_hrv_rmssd: round1(avg_hrv),
        min_hrv: etl_common::stats::min_f64(&values),
        max_hrv: etl_common::stats::max_f64(&values),
        std_dev: round1(etl_common::stats::stdev(&values)),
        hrv_category,
        recovery_status,
    }
}

struct Trend {
    label: &'static str,
    change_percent: f64,
    description: String,
}

fn analyze_trend(readings: &[Reading]) -> Option<Trend> {
    if readings.len() < 7 {
        return None;
    }

    let mid = readings.len() / 2;
    let first_half: Vec<f64> = readings[..mid].iter().map(|r| r.rmssd_ms).collect();
    let second_half: Vec<f64> = readings[mid..].iter().map(|r| r.rmssd_ms).collect();

    let avg_first = etl_common::stats::mean(&first_half);
    let avg_second = etl_common::stats::mean(&second_half);
    if avg_first == 0.0 {
        return None;
    }

    let change_pct = (avg_second - avg_first) / avg_first * 100.0;

    let (label, description) = if change_pct > 10.0 {
        (
            "improving",
            format!("HRV is improving over time (+{change_pct:.1}%), indicating better recovery and adaptation to training."),
        )
    } else if change_pct < -10.0 {
        (
            "declining",
            format!("HRV is declining over time ({change_pct:.1}%), which may indicate overtraining or increased stress."),
        )
    } else {
        ("stable", "HRV remains stable over the period.".to_string())
    };

    Some(Trend {
        label,
        change_percent: round1(change_pct),
        description,
    })
}

fn generate_narrative(total_readings: usize, metrics: &Metrics, trend: &Option<Trend>) -> String {
    let mut parts = Vec::new();
    let avg_hrv = metrics.avg_hrv_rmssd;

    parts.push(format!(
        "Heart rate variability (HRV RMSSD) data shows {total_readings} reading(s) with average of {avg_hrv} ms."
    ));

    let status_text = match metrics.recovery_status {
        "excellent" => format!("HRV is excellent ({avg_hrv} ms), indicating superior cardiovascular fitness and recovery capacity."),
        "good" => format!("HRV is good ({avg_hrv} ms), indicating healthy recovery and stress management."),
        "normal" => format!("HRV is in normal range ({avg_hrv} ms)."),
        _ => format!("HRV is below optimal ({avg_hrv} ms). Low HRV may indicate stress, poor recovery, or overtraining. Consider rest and recovery."),
    };
    parts.push(status_text);

    if let Some(t) = trend {
        parts.push(t.description.clone());
    }

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
            record_type: "HeartRateVariabilityRmssdRecord".into(),
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

    fn reading(rmssd: f64, epoch_millis: i64) -> Value {
        json!({
            "heartRateVariabilityRmssd": {"inMilliseconds": rmssd},
            "time": {"epochMillis": epoch_millis},
        })
    }

    #[tokio::test]
    async fn low_hrv_flagged_as_poor_recovery() {
        let processor = HrvProcessor;
        let base = 1_700_000_000_000i64;
        let records: Vec<Value> = (0..5).map(|i| reading(15.0, base + i * 3_600_000)).collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert_eq!(result.clinical_insights["metrics"]["recovery_status"], "poor");
    }

    #[tokio::test]
    async fn improving_trend_detected_with_seven_or_more_readings() {
        let processor = HrvProcessor;
        let base = 1_700_000_000_000i64;
        let mut bpms = vec![40.0; 4];
        bpms.extend(vec![60.0; 4]);
        let records: Vec<Value> = bpms
            .iter()
            .enumerate()
            .map(|(i, v)| reading(*v, base + i as i64 * 3_600_000))
            .collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert_eq!(result.clinical_insights["trends"]["trend"], "improving");
    }

    #[tokio::test]
    async fn no_readings_is_a_classified_failure() {
        let processor = HrvProcessor;
        let result = processor
            .process(&[json!({})], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }
}
