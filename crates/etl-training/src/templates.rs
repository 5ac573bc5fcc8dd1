use serde_json::Value;

/// Domain-appropriate instruction/input pair for a training line.
///
/// `input` always embeds the integer record count so a model fine-tuned on
/// the resulting JSONL sees how many raw readings backed the narrative.
pub fn generate_instruction_input(record_type: &str, record_count: u64, clinical_insights: &Value) -> (String, String) {
    let count_phrase = format_count(record_type, record_count);

    match record_type {
        "BloodGlucoseRecord" => (
            "Analyze the following blood glucose readings and provide a clinical summary of glycemic control."
                .to_string(),
            format!(
                "Patient blood glucose data: {count_phrase}. Summarize glycemic patterns, time-in-range, and variability."
            ),
        ),
        "HeartRateRecord" => (
            "Analyze the following heart rate data and summarize cardiovascular fitness indicators.".to_string(),
            format!("Patient heart rate data: {count_phrase}. Summarize resting rate, exercise sessions, and zone distribution."),
        ),
        "SleepSessionRecord" => (
            "Analyze the following sleep session data and summarize sleep quality.".to_string(),
            format!("Patient sleep data: {count_phrase}. Summarize duration, consistency, and sleep quality."),
        ),
        "StepsRecord" => (
            "Analyze the following step count data and summarize physical activity levels.".to_string(),
            format!("Patient step count data: {count_phrase}. Summarize daily activity against recommended targets."),
        ),
        "ActiveCaloriesBurnedRecord" => (
            "Analyze the following active calorie burn data and summarize physical activity intensity.".to_string(),
            format!("Patient active calorie data: {count_phrase}. Summarize daily energy expenditure from exercise."),
        ),
        "HeartRateVariabilityRmssdRecord" => (
            "Analyze the following heart rate variability data and summarize recovery and cardiovascular fitness."
                .to_string(),
            format!("Patient HRV data: {count_phrase}. Summarize recovery status and training adaptation trends."),
        ),
        _ => (
            "Analyze the following health data and provide clinical insights.".to_string(),
            format!("Patient health data: {count_phrase}. Clinical insights: {clinical_insights}."),
        ),
    }
}

fn format_count(record_type: &str, record_count: u64) -> String {
    let noun = match record_type {
        "BloodGlucoseRecord" => "readings",
        "HeartRateRecord" | "HeartRateVariabilityRmssdRecord" => "samples",
        _ => "records",
    };
    format!("{record_count} {noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blood_glucose_instruction_names_the_domain() {
        let (instruction, input) = generate_instruction_input("BloodGlucoseRecord", 42, &json!({}));
        assert!(instruction.contains("blood glucose"));
        assert!(instruction.contains("Analyze"));
        assert!(input.contains("42"));
    }

    #[test]
    fn unknown_record_type_falls_back_to_general_template() {
        let (instruction, input) = generate_instruction_input("SomeFutureRecord", 3, &json!({"a": 1}));
        assert!(instruction.contains("health data"));
        assert!(instruction.contains("clinical insights") || input.contains("Clinical insights"));
    }

    #[test]
    fn heart_rate_instruction_mentions_cardiovascular() {
        let (instruction, _) = generate_instruction_input("HeartRateRecord", 10, &json!({}));
        assert!(instruction.contains("heart rate"));
        assert!(instruction.contains("cardiovascular"));
    }

    #[test]
    fn sleep_instruction_mentions_quality() {
        let (instruction, _) = generate_instruction_input("SleepSessionRecord", 5, &json!({}));
        assert!(instruction.contains("sleep"));
        assert!(instruction.contains("quality"));
    }
}
