use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use etl_common::{ClinicalResult, ProcessingEnvelope};
use serde_json::{json, Value};
use tracing::info;

use crate::classified_failure;
use crate::validation::ValidationResult;
use crate::ClinicalProcessor;

struct Stage {
    name: String,
    duration_hours: f64,
}

struct Session {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_hours: f64,
    stages: Vec<Stage>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DurationQuality {
    Good,
    Fair,
    Poor,
}

struct Analyzed {
    duration_hours: f64,
    duration_category: &'static str,
    duration_quality: DurationQuality,
    bedtime_quality: &'static str,
    waketime_quality: &'static str,
    sleep_efficiency: Option<f64>,
    start_time: DateTime<Utc>,
}

pub struct SleepProcessor;

#[async_trait]
impl ClinicalProcessor for SleepProcessor {
    fn record_type(&self) -> &'static str {
        "SleepSessionRecord"
    }

    async fn process(
        &self,
        records: &[Value],
        envelope: &ProcessingEnvelope,
        validation: &ValidationResult,
    ) -> ClinicalResult {
        let sessions = extract_sessions(records);
        if sessions.is_empty() {
            return classified_failure(envelope, "no valid sleep sessions found");
        }

        let analyzed = analyze_sessions(&sessions);
        let metrics = calculate_metrics(&analyzed);
        let patterns = identify_patterns(&analyzed);
        let narrative = generate_narrative(&analyzed, &patterns, &metrics);
        let clinical_insights = clinical_insights(&analyzed, &patterns, &metrics);

        info!(
            records_processed = records.len(),
            sessions_extracted = sessions.len(),
            quality_score = validation.quality_score,
            "sleep processing complete"
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

fn epoch_millis(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    let millis = record.get(field)?.get("epochMillis")?.as_i64()?;
    DateTime::from_timestamp_millis(millis)
}

fn extract_sessions(records: &[Value]) -> Vec<Session> {
    let mut sessions: Vec<Session> = records
        .iter()
        .filter_map(|record| {
            let start_time = epoch_millis(record, "startTime")?;
            let end_time = epoch_millis(record, "endTime")?;
            let duration_hours = (end_time - start_time).num_milliseconds() as f64 / 3_600_000.0;

            let stages = record
                .get("stages")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|s| {
                            let stage_start = epoch_millis(s, "startTime")?;
                            let stage_end = epoch_millis(s, "endTime")?;
                            let name = s.get("stage")?.as_str()?.to_string();
                            Some(Stage {
                                name,
                                duration_hours: (stage_end - stage_start).num_milliseconds() as f64 / 3_600_000.0,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            Some(Session {
                start_time,
                end_time,
                duration_hours,
                stages,
            })
        })
        .collect();

    sessions.sort_by_key(|s| s.start_time);
    sessions
}

fn duration_category(hours: f64) -> (&'static str, DurationQuality) {
    if hours < 6.0 {
        ("insufficient", DurationQuality::Poor)
    } else if hours < 7.0 {
        ("short", DurationQuality::Fair)
    } else if hours <= 9.0 {
        ("optimal", DurationQuality::Good)
    } else if hours <= 10.0 {
        ("long", DurationQuality::Good)
    } else {
        ("excessive", DurationQuality::Fair)
    }
}

fn bedtime_quality(hour: u32) -> &'static str {
    if (21..=23).contains(&hour) {
        "optimal"
    } else if (20..24).contains(&hour) {
        "acceptable"
    } else {
        "suboptimal"
    }
}

fn waketime_quality(hour: u32) -> &'static str {
    if (5..=8).contains(&hour) {
        "optimal"
    } else if (4..9).contains(&hour) {
        "acceptable"
    } else {
        "suboptimal"
    }
}

fn stage_efficiency(stages: &[Stage]) -> Option<f64> {
    if stages.is_empty() {
        return None;
    }
    let total: f64 = stages.iter().map(|s| s.duration_hours).sum();
    if total <= 0.0 {
        return None;
    }
    let awake: f64 = stages.iter().filter(|s| s.name == "AWAKE").map(|s| s.duration_hours).sum();
    Some((1.0 - awake / total) * 100.0)
}

fn analyze_sessions(sessions: &[Session]) -> Vec<Analyzed> {
    sessions
        .iter()
        .map(|s| {
            let (duration_category, duration_quality) = duration_category(s.duration_hours);
            Analyzed {
                duration_hours: s.duration_hours,
                duration_category,
                duration_quality,
                bedtime_quality: bedtime_quality(s.start_time.hour()),
                waketime_quality: waketime_quality(s.end_time.hour()),
                sleep_efficiency: stage_efficiency(&s.stages),
                start_time: s.start_time,
            }
        })
        .collect()
}

struct Metrics {
    total_sessions: usize,
    avg_duration_hours: f64,
    duration_std_hours: f64,
    avg_sleep_efficiency: Option<f64>,
    sleep_health_status: &'static str,
}

fn calculate_metrics(analyzed: &[Analyzed]) -> Metrics {
    let durations: Vec<f64> = analyzed.iter().map(|a| a.duration_hours).collect();
    let avg_duration_hours = round1(etl_common::stats::mean(&durations));
    let duration_std_hours = round1(etl_common::stats::stdev(&durations));

    let efficiencies: Vec<f64> = analyzed.iter().filter_map(|a| a.sleep_efficiency).collect();
    let avg_sleep_efficiency = if efficiencies.is_empty() {
        None
    } else {
        Some(round1(etl_common::stats::mean(&efficiencies)))
    };

    let good_fraction = analyzed.iter().filter(|a| a.duration_quality == DurationQuality::Good).count() as f64 / analyzed.len() as f64;
    let poor_fraction = analyzed.iter().filter(|a| a.duration_quality == DurationQuality::Poor).count() as f64 / analyzed.len() as f64;

    let sleep_health_status = if good_fraction >= 0.8 && duration_std_hours < 1.0 {
        "excellent"
    } else if good_fraction >= 0.6 {
        "good"
    } else if poor_fraction >= 0.6 {
        "poor"
    } else {
        "fair"
    };

    Metrics {
        total_sessions: analyzed.len(),
        avg_duration_hours,
        duration_std_hours,
        avg_sleep_efficiency,
        sleep_health_status,
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

struct WeekendVsWeekday {
    weekday_avg: f64,
    weekend_avg: f64,
    sleep_debt: bool,
}

struct Patterns {
    consistency: Option<&'static str>,
    bedtime_consistency: Option<&'static str>,
    weekend_vs_weekday: Option<WeekendVsWeekday>,
}

fn consistency_tier(std_hours: f64) -> &'static str {
    if std_hours < 0.5 {
        "excellent"
    } else if std_hours < 1.0 {
        "good"
    } else if std_hours < 1.5 {
        "fair"
    } else {
        "poor"
    }
}

fn identify_patterns(analyzed: &[Analyzed]) -> Patterns {
    if analyzed.len() < 7 {
        return Patterns {
            consistency: None,
            bedtime_consistency: None,
            weekend_vs_weekday: None,
        };
    }

    let durations: Vec<f64> = analyzed.iter().map(|a| a.duration_hours).collect();
    let duration_std = etl_common::stats::stdev(&durations);
    let consistency = Some(consistency_tier(duration_std));

    let bedtime_hours: Vec<f64> = analyzed.iter().map(|a| a.start_time.hour() as f64).collect();
    let bedtime_std = etl_common::stats::stdev(&bedtime_hours);
    let bedtime_consistency = Some(consistency_tier(bedtime_std));

    let (weekday, weekend): (Vec<&Analyzed>, Vec<&Analyzed>) = analyzed
        .iter()
        .partition(|a| !matches!(a.start_time.weekday(), Weekday::Sat | Weekday::Sun));
    let weekday_avg = etl_common::stats::mean(&weekday.iter().map(|a| a.duration_hours).collect::<Vec<_>>());
    let weekend_avg = etl_common::stats::mean(&weekend.iter().map(|a| a.duration_hours).collect::<Vec<_>>());
    let weekend_vs_weekday = if !weekday.is_empty() && !weekend.is_empty() {
        Some(WeekendVsWeekday {
            weekday_avg: round1(weekday_avg),
            weekend_avg: round1(weekend_avg),
            sleep_debt: (weekend_avg - weekday_avg).abs() > 1.0,
        })
    } else {
        None
    };

    Patterns {
        consistency,
        bedtime_consistency,
        weekend_vs_weekday,
    }
}

fn generate_narrative(analyzed: &[Analyzed], patterns: &Patterns, metrics: &Metrics) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "Sleep data shows {} sleep session(s) with average duration of {} hours.",
        analyzed.len(),
        metrics.avg_duration_hours
    ));

    let good_count = analyzed.iter().filter(|a| a.duration_quality == DurationQuality::Good).count();
    let optimal_count = analyzed.iter().filter(|a| a.duration_category == "optimal").count();
    if optimal_count as f64 / analyzed.len() as f64 >= 0.7 {
        parts.push(format!(
            "Sleep duration is optimal for {optimal_count} of {} sessions, supporting good recovery and cognitive function.",
            analyzed.len()
        ));
    } else if good_count as f64 / analyzed.len() as f64 < 0.5 {
        parts.push("Sleep duration frequently falls outside the recommended range.".to_string());
    }

    if let Some(efficiency) = metrics.avg_sleep_efficiency {
        parts.push(format!("Average sleep efficiency is {efficiency}%."));
    }

    if let Some(consistency) = patterns.consistency {
        parts.push(format!("Sleep duration consistency is {consistency} (std dev {} hours).", metrics.duration_std_hours));
    }

    if let Some(wvw) = &patterns.weekend_vs_weekday {
        if wvw.sleep_debt {
            parts.push(format!(
                "A sleep debt pattern is present: weekday average {} hours vs weekend average {} hours.",
                wvw.weekday_avg, wvw.weekend_avg
            ));
        }
    }

    parts.push(format!("Overall sleep health status is {}.", metrics.sleep_health_status));

    let recommendations = generate_recommendations(analyzed, patterns, metrics);
    if !recommendations.is_empty() {
        parts.push(format!("Recommendations: {recommendations}"));
    }

    parts.join(" ")
}

fn generate_recommendations(analyzed: &[Analyzed], patterns: &Patterns, metrics: &Metrics) -> String {
    let mut recommendations = Vec::new();

    let insufficient = analyzed.iter().filter(|a| a.duration_category == "insufficient").count();
    if insufficient as f64 / analyzed.len() as f64 > 0.3 {
        recommendations.push("increase sleep duration to reach the recommended 7-9 hour range".to_string());
    }

    if let Some(consistency) = patterns.consistency {
        if consistency == "poor" || consistency == "fair" {
            recommendations.push("maintain a more consistent sleep schedule".to_string());
        }
    }

    if metrics.avg_sleep_efficiency.map(|e| e < 85.0).unwrap_or(false) {
        recommendations.push("address factors contributing to nighttime awakenings".to_string());
    }

    if let Some(wvw) = &patterns.weekend_vs_weekday {
        if wvw.sleep_debt {
            recommendations.push("reduce the gap between weekday and weekend sleep to limit accumulated sleep debt".to_string());
        }
    }

    recommendations.join("; ")
}

fn clinical_insights(analyzed: &[Analyzed], patterns: &Patterns, metrics: &Metrics) -> Value {
    let optimal_sessions = analyzed.iter().filter(|a| a.duration_category == "optimal").count();
    let poor_sessions = analyzed.iter().filter(|a| a.duration_quality == DurationQuality::Poor).count();

    json!({
        "record_type": "SleepSessionRecord",
        "total_sessions": analyzed.len(),
        "optimal_sessions": optimal_sessions,
        "poor_sessions": poor_sessions,
        "sleep_metrics": {
            "total_sessions": metrics.total_sessions,
            "avg_duration_hours": metrics.avg_duration_hours,
            "duration_std_hours": metrics.duration_std_hours,
            "avg_sleep_efficiency": metrics.avg_sleep_efficiency,
            "sleep_health_status": metrics.sleep_health_status,
        },
        "sleep_patterns": {
            "consistency": patterns.consistency,
            "bedtime_consistency": patterns.bedtime_consistency,
            "weekend_vs_weekday": patterns.weekend_vs_weekday.as_ref().map(|w| json!({
                "weekday_avg": w.weekday_avg,
                "weekend_avg": w.weekend_avg,
                "sleep_debt": w.sleep_debt,
            })),
        },
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
            record_type: "SleepSessionRecord".into(),
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

    fn session(start_epoch_millis: i64, duration_hours: i64) -> Value {
        json!({
            "startTime": {"epochMillis": start_epoch_millis},
            "endTime": {"epochMillis": start_epoch_millis + duration_hours * 3_600_000},
            "stages": [],
        })
    }

    #[tokio::test]
    async fn no_sessions_is_a_classified_failure() {
        let processor = SleepProcessor;
        let result = processor
            .process(&[json!({})], &envelope(), &ValidationResult::passthrough(1.0))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn optimal_eight_hour_sessions_are_reported_as_optimal() {
        let processor = SleepProcessor;
        let base = 1_704_099_600_000i64;
        let records: Vec<Value> = (0..10).map(|i| session(base + i * 86_400_000, 8)).collect();

        let result = processor
            .process(&records, &envelope(), &ValidationResult::passthrough(1.0))
            .await;

        assert!(result.success);
        assert!(result.narrative.unwrap().to_lowercase().contains("optimal"));
        assert_eq!(result.clinical_insights["total_sessions"], 10);
    }
}
