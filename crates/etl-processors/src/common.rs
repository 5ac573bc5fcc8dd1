use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;

/// Pulls `obj[path.0][path.1]...` as an `f64`, tolerating both integers
/// and floats the way the original Avro records do.
pub fn get_path_f64(record: &Value, path: &[&str]) -> Option<f64> {
    let mut cur = record;
    for segment in path {
        cur = cur.get(segment)?;
    }
    cur.as_f64()
}

pub fn get_path_str<'a>(record: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = record;
    for segment in path {
        cur = cur.get(segment)?;
    }
    cur.as_str()
}

/// `{"epochMillis": N}` -> UTC timestamp, the nested-object timestamp
/// shape used throughout the source Avro schemas.
pub fn epoch_millis_timestamp(record: &Value, field: &str) -> Option<DateTime<Utc>> {
    let millis = record.get(field)?.get("epochMillis")?.as_i64()?;
    DateTime::from_timestamp_millis(millis)
}

pub fn local_hour(ts: &DateTime<Utc>) -> u32 {
    ts.hour()
}

/// First present-and-truthy value among several candidate field names,
/// mirroring the original extractors' `a.get('x') or a.get('y')` fallback
/// idiom for records that may come from slightly different schema
/// versions.
pub fn first_present_f64(record: &Value, field_candidates: &[&str]) -> Option<f64> {
    for field in field_candidates {
        if let Some(v) = record.get(*field).and_then(Value::as_f64) {
            return Some(v);
        }
    }
    None
}
