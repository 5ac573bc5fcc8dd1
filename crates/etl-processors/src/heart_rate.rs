use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use tracing::info;

use crate::classified_failure;
use crate::common::local_hour;
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

const DEFAULT_MAX_HR: f64 = 180.0;
const EXERCISE_THRESHOLD_BPM: f64 = 100.0;
const MIN_SESSION_MINUTES: f64 = 10.0;

struct Sample {
    bpm: f64,
    timestamp: DateTime<Utc>,
}

pub struct HeartRateProcessor;

#[async_trait]
impl ClinicalProcessor for HeartRateProcessor {
    fn record_type(&self) -> &'static str {
        "HeartRateRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let samples = extract_samples(records);
        if samples.is_empty() {
            return classified_failure(envelope, "no valid heart rate samples found");
        }

        let classifications = classify(&samples);
        let patterns = identify_patterns(&samples, &classifications);
        let metrics = calculate_metrics(&samples, &patterns);
        let narrative = generate_narrative(&samples, &patterns, &metrics);
        let clinical_insights = clinical_insights(&classifications, &patterns, &metrics);

        info!(
            records_processed = records.len(),
            samples_extracted = samples.len(),
            quality_score = validation.quality_score,
            "heart rate processing complete"
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

fn extract_samples(records: &[Value]) -> Vec<Sample> {
    let mut samples = Vec::new();

    for record in records {
        let record_epoch = record.get("time").and_then(|t| t.get("epochMillis")).and_then(Value::as_i64);
        let Some(inner_samples) = record.get("samples").and_then(Value::as_array) else {
            continue;
        };

        for sample in inner_samples {
            let Some(bpm) = sample.get("beatsPerMinute").and_then(Value::as_f64) else {
                continue;
            };
            let sample_epoch = sample.get("time").and_then(|t| t.get("epochMillis")).and_then(Value::as_i64);
            let Some(epoch_millis) = sample_epoch.or(record_epoch) else {
                continue;
            };
            let Some(timestamp) = DateTime::from_timestamp_millis(epoch_millis) else {
                continue;
            };

            samples.push(Sample { bpm, timestamp });
        }
    }

    samples.sort_by_key(|s| s.timestamp);
    samples
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Severity {
    Critical,
    Warning,
    Info,
    Normal,
}

struct Classification {
    category: &'static str,
    severity: Severity,
    bpm: f64,
    timestamp: DateTime<Utc>,
}

fn classify_bpm(bpm: f64) -> &'static str {
    if bpm < 40.0 {
        "severe_bradycardia"
    } else if bpm < 60.0 {
        "bradycardia"
    } else if bpm < 100.0 {
        "normal_resting"
    } else if bpm < 120.0 {
        "elevated"
    } else if bpm < 150.0 {
        "tachycardia"
    } else {
        "severe_tachycardia"
    }
}

fn classify(samples: &[Sample]) -> Vec<Classification> {
    samples
        .iter()
        .map(|s| {
            let category = classify_bpm(s.bpm);
            let severity = match category {
                "severe_bradycardia" => Severity::Critical,
                "bradycardia" => Severity::Warning,
                "normal_resting" => Severity::Normal,
                "elevated" => Severity::Info,
                "tachycardia" => Severity::Warning,
                "severe_tachycardia" => Severity::Critical,
                _ => Severity::Warning,
            };
            Classification {
                category,
                severity,
                bpm: s.bpm,
                timestamp: s.timestamp,
            }
        })
        .collect()
}

struct ExerciseSession {
    duration_minutes: f64,
    avg_bpm: f64,
    recovery_bpm_1min: Option<f64>,
}

struct Patterns {
    sleep_periods: Vec<f64>,
    resting_heart_rate: Option<f64>,
    elevated_events: Vec<(DateTime<Utc>, f64, &'static str)>,
    bradycardia_events: Vec<(DateTime<Utc>, f64)>,
    exercise_sessions: Vec<ExerciseSession>,
}

fn identify_patterns(samples: &[Sample], classifications: &[Classification]) -> Patterns {
    let sleep_periods: Vec<f64> = samples
        .iter()
        .filter(|s| {
            let hour = local_hour(&s.timestamp);
            (hour >= 22 || hour <= 6) && s.bpm < 80.0
        })
        .map(|s| s.bpm)
        .collect();

    let resting_heart_rate = if !sleep_periods.is_empty() {
        let mut sorted = sleep_periods.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let bottom_count = (sorted.len() / 5).max(1);
        Some(etl_common::stats::mean(&sorted[..bottom_count]))
    } else if !samples.is_empty() {
        Some(etl_common::stats::min_f64(&samples.iter().map(|s| s.bpm).collect::<Vec<_>>()))
    } else {
        None
    };

    let elevated_events = classifications
        .iter()
        .filter(|c| matches!(c.category, "tachycardia" | "severe_tachycardia"))
        .map(|c| (c.timestamp, c.bpm, c.category))
        .collect();

    let bradycardia_events = samples
        .iter()
        .filter(|s| {
            let hour = local_hour(&s.timestamp);
            s.bpm < 50.0 && !(hour >= 22 || hour <= 6)
        })
        .map(|s| (s.timestamp, s.bpm))
        .collect();

    let exercise_sessions = detect_exercise_sessions(samples);

    Patterns {
        sleep_periods,
        resting_heart_rate,
        elevated_events,
        bradycardia_events,
        exercise_sessions,
    }
}

fn detect_exercise_sessions(samples: &[Sample]) -> Vec<ExerciseSession> {
    let mut sessions = Vec::new();
    let mut current: Option<(DateTime<Utc>, Vec<f64>)> = None;

    let close_session = |start: DateTime<Utc>, bpms: &[f64], end_ts: DateTime<Utc>, following_bpm: Option<f64>, sessions: &mut Vec<ExerciseSession>| {
        let duration_minutes = (end_ts - start).num_seconds() as f64 / 60.0;
        if duration_minutes >= MIN_SESSION_MINUTES {
            sessions.push(ExerciseSession {
                duration_minutes,
                avg_bpm: etl_common::stats::mean(bpms),
                recovery_bpm_1min: following_bpm.map(|f| bpms.last().copied().unwrap_or(0.0) - f),
            });
        }
    };

    for sample in samples {
        if sample.bpm >= EXERCISE_THRESHOLD_BPM {
            match &mut current {
                Some((_, bpms)) => bpms.push(sample.bpm),
                None => current = Some((sample.timestamp, vec![sample.bpm])),
            }
        } else if let Some((start, bpms)) = current.take() {
            let end_ts = samples
                .iter()
                .rev()
                .find(|s| s.bpm >= EXERCISE_THRESHOLD_BPM && s.timestamp >= start)
                .map(|s| s.timestamp)
                .unwrap_or(start);
            close_session(start, &bpms, end_ts, Some(sample.bpm), &mut sessions);
        }
    }

    if let Some((start, bpms)) = current {
        let end_ts = samples.last().map(|s| s.timestamp).unwrap_or(start);
        close_session(start, &bpms, end_ts, None, &mut sessions);
    }

    sessions
}

struct ZoneDistribution {
    very_light: f64,
    light: f64,
    moderate: f64,
    hard: f64,
    maximum: f64,
}

fn zone_distribution(values: &[f64], max_hr: f64) -> ZoneDistribution {
    let total = values.len() as f64;
    let mut counts = [0usize; 5];
    for hr in values {
        let pct = hr / max_hr;
        let idx = if pct < 0.60 {
            0
        } else if pct < 0.70 {
            1
        } else if pct < 0.80 {
            2
        } else if pct < 0.90 {
            3
        } else {
            4
        };
        counts[idx] += 1;
    }
    ZoneDistribution {
        very_light: round1(counts[0] as f64 / total * 100.0),
        light: round1(counts[1] as f64 / total * 100.0),
        moderate: round1(counts[2] as f64 / total * 100.0),
        hard: round1(counts[3] as f64 / total * 100.0),
        maximum: round1(counts[4] as f64 / total * 100.0),
    }
}

struct Metrics {
    mean_heart_rate: f64,
    min_heart_rate: f64,
    max_heart_rate: f64,
    resting_heart_rate: f64,
    std_dev: f64,
    zone_distribution: ZoneDistribution,
    total_samples: usize,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn calculate_metrics(samples: &[Sample], patterns: &Patterns) -> Metrics {
    let values: Vec<f64> = samples.iter().map(|s| s.bpm).collect();
    let mean_heart_rate = etl_common::stats::mean(&values);
    let std_dev = etl_common::stats::stdev(&values);
    let min_heart_rate = etl_common::stats::min_f64(&values);
    let resting_heart_rate = patterns.resting_heart_rate.unwrap_or(min_heart_rate);

    Metrics {
        mean_heart_rate: round1(mean_heart_rate),
        min_heart_rate,
        max_heart_rate: etl_common::stats::max_f64(&values),
        resting_heart_rate: round1(resting_heart_rate),
        std_dev: round1(std_dev),
        zone_distribution: zone_distribution(&values, DEFAULT_MAX_HR),
        total_samples: samples.len(),
    }
}

fn generate_narrative(samples: &[Sample], patterns: &Patterns, metrics: &Metrics) -> String {
    let mut parts = Vec::new();

    let duration_hours = (samples.last().unwrap().timestamp - samples.first().unwrap().timestamp).num_seconds() as f64 / 3600.0;
    parts.push(format!(
        "Heart rate data shows {} measurements over {:.1} hours with mean heart rate of {} bpm.",
        samples.len(),
        duration_hours,
        metrics.mean_heart_rate
    ));

    let rhr = metrics.resting_heart_rate;
    let rhr_text = if rhr < 60.0 {
        format!("Resting heart rate is excellent at {rhr} bpm, indicating good cardiovascular fitness.")
    } else if rhr <= 70.0 {
        format!("Resting heart rate is good at {rhr} bpm.")
    } else if rhr <= 80.0 {
        format!("Resting heart rate is average at {rhr} bpm.")
    } else {
        format!("Resting heart rate is elevated at {rhr} bpm. Consider cardiovascular conditioning to improve fitness.")
    };
    parts.push(rhr_text);

    if !patterns.exercise_sessions.is_empty() {
        let total_exercise_time: f64 = patterns.exercise_sessions.iter().map(|s| s.duration_minutes).sum();
        let avg_bpms: Vec<f64> = patterns.exercise_sessions.iter().map(|s| s.avg_bpm).collect();
        let avg_exercise_hr = etl_common::stats::mean(&avg_bpms);

        parts.push(format!(
            "Detected {} exercise session(s) totaling {:.0} minutes with average exercise heart rate of {:.0} bpm.",
            patterns.exercise_sessions.len(),
            total_exercise_time,
            avg_exercise_hr
        ));

        let recoveries: Vec<f64> = patterns.exercise_sessions.iter().filter_map(|s| s.recovery_bpm_1min).collect();
        if !recoveries.is_empty() {
            let avg_recovery = etl_common::stats::mean(&recoveries);
            let text = if avg_recovery > 25.0 {
                format!("Heart rate recovery is excellent (avg {avg_recovery:.0} bpm drop), indicating strong cardiovascular fitness.")
            } else if avg_recovery > 15.0 {
                format!("Heart rate recovery is good (avg {avg_recovery:.0} bpm drop).")
            } else {
                format!("Heart rate recovery is fair (avg {avg_recovery:.0} bpm drop). Improved fitness may enhance recovery rate.")
            };
            parts.push(text);
        }
    }

    if !patterns.elevated_events.is_empty() {
        let severe_count = patterns.elevated_events.iter().filter(|(_, _, cat)| *cat == "severe_tachycardia").count();
        if severe_count > 0 {
            parts.push(format!(
                "Alert: {severe_count} severe tachycardia event(s) detected (>150 bpm). Medical review recommended if not exercise-related."
            ));
        } else {
            parts.push(format!(
                "{} elevated heart rate reading(s) detected (120-150 bpm).",
                patterns.elevated_events.len()
            ));
        }
    }

    if !patterns.bradycardia_events.is_empty() {
        parts.push(format!(
            "{} bradycardia reading(s) detected during waking hours (<50 bpm). This may be normal for well-trained athletes.",
            patterns.bradycardia_events.len()
        ));
    }

    let moderate_plus = metrics.zone_distribution.moderate + metrics.zone_distribution.hard + metrics.zone_distribution.maximum;
    if moderate_plus > 20.0 {
        parts.push(format!(
            "{moderate_plus:.0}% of time spent in moderate to vigorous intensity zones, indicating active cardiovascular exercise."
        ));
    }

    parts.join(" ")
}

fn clinical_insights(classifications: &[Classification], patterns: &Patterns, metrics: &Metrics) -> Value {
    let critical_events = classifications.iter().filter(|c| c.severity == Severity::Critical).count();
    let warning_events = classifications.iter().filter(|c| c.severity == Severity::Warning).count();
    let normal_events = classifications.iter().filter(|c| c.severity == Severity::Normal).count();

    let rhr = metrics.resting_heart_rate;
    let fitness_level = if rhr < 60.0 {
        "excellent"
    } else if rhr <= 70.0 {
        "good"
    } else if rhr <= 80.0 {
        "average"
    } else {
        "below_average"
    };

    json!({
        "record_type": "HeartRateRecord",
        "total_samples": classifications.len(),
        "critical_events": critical_events,
        "warning_events": warning_events,
        "normal_events": normal_events,
        "elevated_hr_events": patterns.elevated_events.len(),
        "bradycardia_events": patterns.bradycardia_events.len(),
        "exercise_sessions": patterns.exercise_sessions.len(),
        "heart_rate_metrics": {
            "mean_heart_rate": metrics.mean_heart_rate,
            "min_heart_rate": metrics.min_heart_rate,
            "max_heart_rate": metrics.max_heart_rate,
            "resting_heart_rate": metrics.resting_heart_rate,
            "std_dev": metrics.std_dev,
            "total_samples": metrics.total_samples,
            "zone_distribution": {
                "very_light": metrics.zone_distribution.very_light,
                "light": metrics.zone_distribution.light,
                "moderate": metrics.zone_distribution.moderate,
                "hard": metrics.zone_distribution.hard,
                "maximum": metrics.zone_distribution.maximum,
            },
        },
        "fitness_level": fitness_level,
        "resting_heart_rate": metrics.resting_heart_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_common::ProcessingEnvelope;
    use serde_json::json;

    fn envelope() -> ProcessingEnvelope {
        ProcessingEnvelope {
            message_id: "m1".into(),
            correlation_id: "c1".into(),
            user_id: "u1".into(),
            record_type: "HeartRateRecord".into(),
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

    fn record_with_samples(bpms: &[(f64, i64)]) -> Value {
        json!({
            "samples": bpms.iter().map(|(bpm, ts)| json!({
                "beatsPerMinute": bpm,
                "time": {"epochMillis": ts},
            })).collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn empty_samples_is_a_classified_failure() {
        let processor = HeartRateProcessor;
        let result = processor
            .process(&[], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn sustained_elevated_hr_is_detected_as_exercise() {
        let processor = HeartRateProcessor;
        let base = 1_700_000_000_000i64;
        let samples: Vec<(f64, i64)> = (0..15).map(|i| (130.0, base + i * 60_000)).collect();
        let record = record_with_samples(&samples);

        let result = processor
            .process(&[record], &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert!(result.clinical_insights["exercise_sessions"].as_u64().unwrap() >= 1);
    }
}
