use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use tracing::info;

use crate::classified_failure;
use crate::common::{epoch_millis_timestamp, get_path_f64, get_path_str, local_hour};
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

const SEVERE_HYPO_MAX: f64 = 54.0;
const HYPO_MAX: f64 = 70.0;
const NORMAL_FASTING_MAX: f64 = 100.0;
const NORMAL_GENERAL_MAX: f64 = 140.0;
const PREDIABETES_FASTING_MAX: f64 = 126.0;
const HYPER_MAX: f64 = 180.0;

struct Reading {
    glucose_mg_dl: f64,
    timestamp: DateTime<Utc>,
    relation_to_meal: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Severity {
    Critical,
    Warning,
    Normal,
}

struct Classification {
    category: &'static str,
    severity: Severity,
    glucose_mg_dl: f64,
    timestamp: DateTime<Utc>,
}

pub struct BloodGlucoseProcessor;

#[async_trait]
impl ClinicalProcessor for BloodGlucoseProcessor {
    fn record_type(&self) -> &'static str {
        "BloodGlucoseRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let readings = extract_readings(records);
        if readings.is_empty() {
            return classified_failure(envelope, "no valid glucose readings found");
        }

        let classifications = classify(&readings);
        let patterns = identify_patterns(&readings, &classifications);
        let metrics = variability_metrics(&readings);
        let narrative = generate_narrative(&readings, &patterns, &metrics);
        let clinical_insights = clinical_insights(&classifications, &patterns, &metrics);

        info!(
            records_processed = records.len(),
            readings_extracted = readings.len(),
            quality_score = validation.quality_score,
            "blood glucose processing complete"
        );

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

/// Pulls glucose level, timestamp, and meal context out of each record,
/// tolerating both the flattened and the nested schema shape (the Avro
/// schema moved the glucose level and timestamp fields to the top level in
/// a later revision; both still show up in the wild).
fn extract_readings(records: &[Value]) -> Vec<Reading> {
    let mut readings: Vec<Reading> = records
        .iter()
        .filter_map(|record| {
            let glucose_mg_dl = record
                .get("levelInMilligramsPerDeciliter")
                .and_then(Value::as_f64)
                .or_else(|| get_path_f64(record, &["level", "inMilligramsPerDeciliter"]))?;

            let timestamp = record
                .get("timeEpochMillis")
                .and_then(Value::as_i64)
                .and_then(DateTime::from_timestamp_millis)
                .or_else(|| epoch_millis_timestamp(record, "time"))?;

            let relation_to_meal = record
                .get("relationToMeal")
                .and_then(Value::as_str)
                .or_else(|| get_path_str(record, &["metadata", "relationToMeal"]))
                .map(str::to_string);

            Some(Reading {
                glucose_mg_dl,
                timestamp,
                relation_to_meal,
            })
        })
        .collect();

    readings.sort_by_key(|r| r.timestamp);
    readings
}

fn classify(readings: &[Reading]) -> Vec<Classification> {
    readings
        .iter()
        .map(|reading| {
            let glucose = reading.glucose_mg_dl;
            let (category, severity) = if glucose < SEVERE_HYPO_MAX {
                ("severe_hypoglycemia", Severity::Critical)
            } else if glucose < HYPO_MAX {
                ("hypoglycemia", Severity::Warning)
            } else if glucose <= NORMAL_FASTING_MAX {
                ("normal_fasting", Severity::Normal)
            } else if glucose <= NORMAL_GENERAL_MAX {
                ("normal_general", Severity::Normal)
            } else if glucose <= HYPER_MAX {
                ("hyperglycemia", Severity::Warning)
            } else {
                ("severe_hyperglycemia", Severity::Critical)
            };

            Classification {
                category,
                severity,
                glucose_mg_dl: glucose,
                timestamp: reading.timestamp,
            }
        })
        .collect()
}

struct Patterns {
    hypoglycemic_events: Vec<(DateTime<Utc>, f64, &'static str)>,
    hyperglycemic_events: Vec<(DateTime<Utc>, f64, &'static str)>,
    fasting_readings: Vec<f64>,
    post_meal_readings: Vec<f64>,
    overnight_readings: Vec<f64>,
    trend: Option<Trend>,
}

struct Trend {
    label: &'static str,
    change_percent: f64,
    description: String,
}

fn identify_patterns(readings: &[Reading], classifications: &[Classification]) -> Patterns {
    let hypoglycemic_events = classifications
        .iter()
        .filter(|c| matches!(c.category, "hypoglycemia" | "severe_hypoglycemia"))
        .map(|c| (c.timestamp, c.glucose_mg_dl, c.category))
        .collect();

    let hyperglycemic_events = classifications
        .iter()
        .filter(|c| matches!(c.category, "hyperglycemia" | "severe_hyperglycemia"))
        .map(|c| (c.timestamp, c.glucose_mg_dl, c.category))
        .collect();

    let fasting_readings = readings
        .iter()
        .filter(|r| (6..=10).contains(&local_hour(&r.timestamp)))
        .map(|r| r.glucose_mg_dl)
        .collect();

    let post_meal_readings = readings
        .iter()
        .filter(|r| {
            matches!(
                r.relation_to_meal.as_deref(),
                Some("AFTER_MEAL") | Some("POSTPRANDIAL")
            )
        })
        .map(|r| r.glucose_mg_dl)
        .collect();

    let overnight_readings = readings
        .iter()
        .filter(|r| {
            let hour = local_hour(&r.timestamp);
            hour >= 22 || hour <= 6
        })
        .map(|r| r.glucose_mg_dl)
        .collect();

    let trend = if readings.len() >= 5 {
        analyze_trend(readings)
    } else {
        None
    };

    Patterns {
        hypoglycemic_events,
        hyperglycemic_events,
        fasting_readings,
        post_meal_readings,
        overnight_readings,
        trend,
    }
}

fn analyze_trend(readings: &[Reading]) -> Option<Trend> {
    let mid = readings.len() / 2;
    let first_half: Vec<f64> = readings[..mid].iter().map(|r| r.glucose_mg_dl).collect();
    let second_half: Vec<f64> = readings[mid..].iter().map(|r| r.glucose_mg_dl).collect();

    let first_mean = etl_common::stats::mean(&first_half);
    let second_mean = etl_common::stats::mean(&second_half);
    if first_mean == 0.0 {
        return None;
    }

    let change_percent = (second_mean - first_mean) / first_mean * 100.0;

    let (label, description) = if change_percent.abs() < 5.0 {
        ("stable", "Glucose levels show stable trend over the period.".to_string())
    } else if change_percent < -5.0 {
        (
            "improving",
            format!(
                "Glucose levels show improving trend over the period with {:.0}% reduction in average glucose.",
                change_percent.abs()
            ),
        )
    } else {
        (
            "worsening",
            format!(
                "Glucose levels show worsening trend over the period with {:.0}% increase in average glucose.",
                change_percent
            ),
        )
    };

    Some(Trend {
        label,
        change_percent: (change_percent * 10.0).round() / 10.0,
        description,
    })
}

struct VariabilityMetrics {
    mean_glucose: f64,
    std_dev: f64,
    coefficient_of_variation: f64,
    time_in_range_percent: f64,
    time_below_range_percent: f64,
    time_above_range_percent: f64,
    min_glucose: f64,
    max_glucose: f64,
}

fn variability_metrics(readings: &[Reading]) -> Option<VariabilityMetrics> {
    if readings.len() < 2 {
        return None;
    }

    let values: Vec<f64> = readings.iter().map(|r| r.glucose_mg_dl).collect();
    let mean_glucose = etl_common::stats::mean(&values);
    let std_dev = etl_common::stats::stdev(&values);
    let cv = etl_common::stats::coefficient_of_variation_percent(&values);

    Some(VariabilityMetrics {
        mean_glucose: round1(mean_glucose),
        std_dev: round1(std_dev),
        coefficient_of_variation: round1(cv),
        time_in_range_percent: round1(etl_common::stats::percent_in_range(&values, 70.0, 180.0)),
        time_below_range_percent: round1(etl_common::stats::percent_below(&values, 70.0)),
        time_above_range_percent: round1(etl_common::stats::percent_above(&values, 180.0)),
        min_glucose: etl_common::stats::min_f64(&values),
        max_glucose: etl_common::stats::max_f64(&values),
    })
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn generate_narrative(readings: &[Reading], patterns: &Patterns, metrics: &Option<VariabilityMetrics>) -> String {
    let mut parts = Vec::new();
    parts.push(summary_statement(readings, metrics));

    if let Some(m) = metrics {
        let cv = m.coefficient_of_variation;
        let tir = m.time_in_range_percent;
        let text = if cv < 36.0 && tir >= 70.0 {
            format!(
                "Glucose control is excellent with low variability (CV {cv}%) and {tir}% time in target range (70-180 mg/dL)."
            )
        } else if cv >= 36.0 {
            format!("Glucose variability is high (CV {cv}%), indicating unstable control. Time in range is {tir}%.")
        } else {
            format!("Glucose variability is moderate (CV {cv}%) with {tir}% time in range.")
        };
        parts.push(text);
    }

    let severe_hypo = patterns
        .hypoglycemic_events
        .iter()
        .filter(|(_, _, cat)| *cat == "severe_hypoglycemia")
        .count();
    let mild_hypo = patterns
        .hypoglycemic_events
        .iter()
        .filter(|(_, _, cat)| *cat == "hypoglycemia")
        .count();
    if severe_hypo > 0 {
        parts.push(format!(
            "Alert: {severe_hypo} severe hypoglycemic event(s) detected (<54 mg/dL), requiring immediate intervention."
        ));
    }
    if mild_hypo > 0 {
        parts.push(format!(
            "{mild_hypo} hypoglycemic reading(s) detected (54-70 mg/dL). Consider adjusting medication or meal timing."
        ));
    }

    let severe_hyper = patterns
        .hyperglycemic_events
        .iter()
        .filter(|(_, _, cat)| *cat == "severe_hyperglycemia")
        .count();
    let mild_hyper = patterns
        .hyperglycemic_events
        .iter()
        .filter(|(_, _, cat)| *cat == "hyperglycemia")
        .count();
    if severe_hyper > 0 {
        parts.push(format!(
            "{severe_hyper} severe hyperglycemic reading(s) detected (>180 mg/dL). Medication adjustment may be needed."
        ));
    } else if mild_hyper > 0 {
        parts.push(format!("{mild_hyper} elevated glucose reading(s) (140-180 mg/dL) observed."));
    }

    if !patterns.fasting_readings.is_empty() {
        let avg_fasting = etl_common::stats::mean(&patterns.fasting_readings);
        let text = if avg_fasting < NORMAL_FASTING_MAX {
            format!("Fasting glucose is well-controlled (avg {avg_fasting:.0} mg/dL).")
        } else if avg_fasting <= PREDIABETES_FASTING_MAX {
            format!("Fasting glucose is elevated (avg {avg_fasting:.0} mg/dL), in prediabetes range (100-126 mg/dL).")
        } else {
            format!("Fasting glucose is significantly elevated (avg {avg_fasting:.0} mg/dL), consistent with diabetes (>126 mg/dL).")
        };
        parts.push(text);
    }

    if let Some(trend) = &patterns.trend {
        parts.push(trend.description.clone());
    }

    let recommendations = generate_recommendations(patterns, metrics);
    if !recommendations.is_empty() {
        parts.push(format!("Recommendations: {recommendations}"));
    }

    parts.join(" ")
}

fn summary_statement(readings: &[Reading], metrics: &Option<VariabilityMetrics>) -> String {
    let Some(m) = metrics else {
        return format!("Blood glucose data shows {} readings.", readings.len());
    };

    let days = if readings.len() >= 2 {
        let span = readings.last().unwrap().timestamp - readings.first().unwrap().timestamp;
        span.num_days().max(1)
    } else {
        1
    };

    format!(
        "Blood glucose data shows {} readings over a {}-day period with mean glucose of {} mg/dL.",
        readings.len(),
        days,
        m.mean_glucose
    )
}

fn generate_recommendations(patterns: &Patterns, metrics: &Option<VariabilityMetrics>) -> String {
    let mut recommendations = Vec::new();

    if !patterns.hypoglycemic_events.is_empty() {
        recommendations.push("Review medication timing to reduce hypoglycemic risk");
    }

    if let Some(m) = metrics {
        if m.time_above_range_percent > 25.0 {
            recommendations.push("Consider medication adjustment to reduce hyperglycemia");
        }
        if m.coefficient_of_variation >= 36.0 {
            recommendations.push("Focus on consistent meal timing and carbohydrate intake to reduce variability");
        }
    }

    if !patterns.fasting_readings.is_empty() {
        let avg_fasting = etl_common::stats::mean(&patterns.fasting_readings);
        if avg_fasting > NORMAL_FASTING_MAX {
            recommendations.push("Monitor fasting glucose closely");
        }
    }

    if let Some(trend) = &patterns.trend {
        if trend.label == "improving" {
            recommendations.push("Continue current management approach as trends are positive");
        }
    }

    recommendations.join("; ")
}

fn clinical_insights(classifications: &[Classification], patterns: &Patterns, metrics: &Option<VariabilityMetrics>) -> Value {
    let critical_events = classifications.iter().filter(|c| c.severity == Severity::Critical).count();
    let warning_events = classifications.iter().filter(|c| c.severity == Severity::Warning).count();
    let normal_events = classifications.iter().filter(|c| c.severity == Severity::Normal).count();

    let control_status = match metrics {
        Some(m) if m.coefficient_of_variation < 36.0 && m.time_in_range_percent >= 70.0 => "excellent",
        Some(m) if m.coefficient_of_variation < 36.0 && m.time_in_range_percent >= 50.0 => "good",
        Some(m) if m.time_in_range_percent >= 50.0 => "fair",
        Some(_) => "poor",
        None => "insufficient_data",
    };

    let metrics_json = metrics.as_ref().map(|m| {
        json!({
            "mean_glucose": m.mean_glucose,
            "std_dev": m.std_dev,
            "coefficient_of_variation": m.coefficient_of_variation,
            "time_in_range_percent": m.time_in_range_percent,
            "time_below_range_percent": m.time_below_range_percent,
            "time_above_range_percent": m.time_above_range_percent,
            "min_glucose": m.min_glucose,
            "max_glucose": m.max_glucose,
        })
    });

    json!({
        "record_type": "BloodGlucoseRecord",
        "total_readings": classifications.len(),
        "critical_events": critical_events,
        "warning_events": warning_events,
        "normal_events": normal_events,
        "hypoglycemic_events_count": patterns.hypoglycemic_events.len(),
        "hyperglycemic_events_count": patterns.hyperglycemic_events.len(),
        "variability_metrics": metrics_json,
        "control_status": control_status,
        "fasting_readings_count": patterns.fasting_readings.len(),
        "post_meal_readings_count": patterns.post_meal_readings.len(),
        "overnight_readings_count": patterns.overnight_readings.len(),
        "trends": patterns.trend.as_ref().map(|t| json!({
            "trend": t.label,
            "change_percent": t.change_percent,
        })),
    })
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
            record_type: "BloodGlucoseRecord".into(),
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

    fn reading(glucose: f64, epoch_millis: i64) -> Value {
        json!({
            "levelInMilligramsPerDeciliter": glucose,
            "timeEpochMillis": epoch_millis,
        })
    }

    #[tokio::test]
    async fn empty_readings_is_a_classified_failure() {
        let processor = BloodGlucoseProcessor;
        let result = processor
            .process(&[], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn severe_hypoglycemia_triggers_alert_narrative() {
        let processor = BloodGlucoseProcessor;
        let records: Vec<Value> = (0..6)
            .map(|i| reading(45.0, 1_700_000_000_000 + i * 3_600_000))
            .collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        let narrative = result.narrative.unwrap();
        assert!(narrative.contains("severe hypoglycemic"));
        assert_eq!(result.clinical_insights["control_status"], "poor");
    }

    #[tokio::test]
    async fn stable_normal_readings_are_excellent_control() {
        let processor = BloodGlucoseProcessor;
        let records: Vec<Value> = (0..8)
            .map(|i| reading(95.0, 1_700_000_000_000 + i * 3_600_000))
            .collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert_eq!(result.clinical_insights["control_status"], "excellent");
    }

    #[test]
    fn old_schema_nested_fields_are_extracted() {
        let record = json!({
            "level": {"inMilligramsPerDeciliter": 110.0},
            "time": {"epochMillis": 1_700_000_000_000i64},
            "metadata": {"relationToMeal": "AFTER_MEAL"},
        });
        let readings = extract_readings(&[record]);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].glucose_mg_dl, 110.0);
        assert_eq!(readings[0].relation_to_meal.as_deref(), Some("AFTER_MEAL"));
    }
}
