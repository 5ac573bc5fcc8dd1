use serde_json::Value;

/// Outcome of the upstream validator. The validator itself lives outside
/// this crate; processors only consume `quality_score` and `is_valid`.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub quality_score: f64,
    pub metadata: Value,
}

impl ValidationResult {
    pub fn passthrough(quality_score: f64) -> Self {
        Self {
            is_valid: true,
            quality_score,
            metadata: Value::Null,
        }
    }
}
