pub mod error;

pub use error::AvroError;

use std::io::Cursor;

use apache_avro::schema::{RecordSchema, Schema};
use apache_avro::types::Value as AvroValue;
use apache_avro::Reader;
use serde_json::{Map, Value as JsonValue};

/// Streams Avro container records one at a time as JSON objects.
/// Never materializes the full record set — the processor pulls records
/// through the `Iterator` implementation at its own pace.
pub struct RecordStream {
    inner: Reader<'static, Cursor<Vec<u8>>>,
}

impl RecordStream {
    /// Opens the container and validates that its writer schema's record
    /// name matches `expected_record_type` before yielding anything.
    pub fn open(data: Vec<u8>, expected_record_type: &str) -> Result<Self, AvroError> {
        let cursor = Cursor::new(data);
        let inner = Reader::new(cursor).map_err(|e| AvroError::Schema(e.to_string()))?;

        if let Schema::Record(RecordSchema { name, .. }) = inner.writer_schema() {
            if name.name != expected_record_type {
                return Err(AvroError::Validation(format!(
                    "expected record type {expected_record_type}, container schema is {}",
                    name.name
                )));
            }
        }

        Ok(Self { inner })
    }
}

impl Iterator for RecordStream {
    type Item = Result<JsonValue, AvroError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(value) => Some(avro_to_json(value).map_err(AvroError::Validation)),
            Err(e) => Some(Err(AvroError::Schema(e.to_string()))),
        }
    }
}

/// Converts an Avro value into the same JSON-object shape the nested
/// record maps take throughout the clinical processors (`record.get('energy', {})`
/// style field access), recursing through records, arrays, maps, and
/// unions.
fn avro_to_json(value: AvroValue) -> Result<JsonValue, String> {
    Ok(match value {
        AvroValue::Null => JsonValue::Null,
        AvroValue::Boolean(b) => JsonValue::Bool(b),
        AvroValue::Int(i) => JsonValue::from(i),
        AvroValue::Long(i) => JsonValue::from(i),
        AvroValue::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        AvroValue::Double(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        AvroValue::Bytes(bytes) => JsonValue::String(hex::encode(bytes)),
        AvroValue::String(s) => JsonValue::String(s),
        AvroValue::Fixed(_, bytes) => JsonValue::String(hex::encode(bytes)),
        AvroValue::Enum(_, symbol) => JsonValue::String(symbol),
        AvroValue::Union(_, inner) => avro_to_json(*inner)?,
        AvroValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(avro_to_json(item)?);
            }
            JsonValue::Array(out)
        }
        AvroValue::Map(entries) => {
            let mut out = Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k, avro_to_json(v)?);
            }
            JsonValue::Object(out)
        }
        AvroValue::Record(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (k, v) in fields {
                out.insert(k, avro_to_json(v)?);
            }
            JsonValue::Object(out)
        }
        AvroValue::Date(days) => JsonValue::from(days),
        AvroValue::Decimal(_) => return Err("decimal avro values are not supported".to_string()),
        AvroValue::TimestampMillis(ms) => JsonValue::from(ms),
        AvroValue::TimestampMicros(us) => JsonValue::from(us),
        AvroValue::TimeMillis(ms) => JsonValue::from(ms),
        AvroValue::TimeMicros(us) => JsonValue::from(us),
        AvroValue::Duration(_) => return Err("duration avro values are not supported".to_string()),
        AvroValue::Uuid(uuid) => JsonValue::String(uuid.to_string()),
        other => return Err(format!("unsupported avro value variant: {other:?}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::types::Record;

    fn sample_schema() -> Schema {
        let raw = r#"
        {
            "type": "record",
            "name": "BloodGlucoseRecord",
            "fields": [
                {"name": "value", "type": "double"},
                {"name": "timestamp", "type": "long"}
            ]
        }
        "#;
        Schema::parse_str(raw).unwrap()
    }

    fn encode_container(schema: &Schema, rows: &[(f64, i64)]) -> Vec<u8> {
        let mut writer = apache_avro::Writer::new(schema, Vec::new());
        for (value, timestamp) in rows {
            let mut record = Record::new(schema).unwrap();
            record.put("value", *value);
            record.put("timestamp", *timestamp);
            writer.append(record).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn streams_records_matching_expected_type() {
        let schema = sample_schema();
        let bytes = encode_container(&schema, &[(142.0, 1000), (70.0, 2000)]);

        let stream = RecordStream::open(bytes, "BloodGlucoseRecord").unwrap();
        let records: Vec<JsonValue> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["value"], 142.0);
    }

    #[test]
    fn rejects_mismatched_record_type() {
        let schema = sample_schema();
        let bytes = encode_container(&schema, &[(1.0, 1)]);

        let err = RecordStream::open(bytes, "HeartRateRecord").unwrap_err();
        assert!(matches!(err, AvroError::Validation(_)));
    }

    #[test]
    fn rejects_unreadable_container() {
        let garbage = vec![0u8, 1, 2, 3, 4];
        let err = RecordStream::open(garbage, "BloodGlucoseRecord").unwrap_err();
        assert!(matches!(err, AvroError::Schema(_)));
    }
}
