//! Column map decoding

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::schema::{FieldKind, FieldValue, TableSchema};

/// UTC offset of the capture pipeline's wall-clock timestamps
const SOURCE_TZ_OFFSET_SECS: i32 = 8 * 3600;

/// Wall-clock format used for string timestamps
const SOURCE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One field that could not be decoded; the rest of the record is
/// unaffected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub field: String,
    pub column: String,
    pub reason: String,
}

/// Decode `columns` into `record` following the schema's bindings
///
/// A binding whose column is absent, or carries JSON null, leaves the
/// target field at its default. A value that does not match the binding's
/// kind is reported as a failure and decoding continues with the next
/// binding, so one bad column never poisons the record.
pub fn decode_into<T>(
    columns: &Map<String, Value>,
    schema: &TableSchema<T>,
    record: &mut T,
) -> Vec<DecodeFailure> {
    let mut failures = Vec::new();
    for binding in schema.bindings() {
        let value = match columns.get(binding.column()) {
            Some(value) if !value.is_null() => value,
            _ => continue,
        };
        match decode_value(binding.kind(), value) {
            Ok(decoded) => binding.apply(record, decoded),
            Err(reason) => failures.push(DecodeFailure {
                field: binding.field().to_string(),
                column: binding.column().to_string(),
                reason,
            }),
        }
    }
    failures
}

fn decode_value(kind: FieldKind, value: &Value) -> std::result::Result<FieldValue, String> {
    match kind {
        // Flag columns arrive as numbers; anything but 1 reads as false.
        FieldKind::Bool => value
            .as_f64()
            .map(|v| FieldValue::Bool(v == 1.0))
            .ok_or_else(|| format!("expected numeric flag, got {}", json_kind(value))),
        FieldKind::String => value
            .as_str()
            .map(|v| FieldValue::String(v.to_string()))
            .ok_or_else(|| format!("expected string, got {}", json_kind(value))),
        FieldKind::Int => value
            .as_f64()
            .map(|v| FieldValue::Int(v as i64))
            .ok_or_else(|| format!("expected number, got {}", json_kind(value))),
        FieldKind::Float => value
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| format!("expected number, got {}", json_kind(value))),
        FieldKind::Timestamp => decode_timestamp(value),
    }
}

/// Timestamps reach us in two encodings: epoch milliseconds (truncated to
/// whole seconds, matching the upstream pipeline) or a wall-clock string
/// in the source deployment's fixed timezone. Both encodings of one
/// instant decode equal.
fn decode_timestamp(value: &Value) -> std::result::Result<FieldValue, String> {
    if let Some(ms) = value.as_f64() {
        let secs = (ms as i64) / 1000;
        return DateTime::from_timestamp(secs, 0)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| format!("epoch milliseconds out of range: {ms}"));
    }
    if let Some(text) = value.as_str() {
        let naive = NaiveDateTime::parse_from_str(text, SOURCE_TS_FORMAT)
            .map_err(|err| format!("unrecognized timestamp {text:?}: {err}"))?;
        let offset = FixedOffset::east_opt(SOURCE_TZ_OFFSET_SECS)
            .ok_or_else(|| "source timezone offset out of range".to_string())?;
        return match offset.from_local_datetime(&naive) {
            LocalResult::Single(instant) => {
                Ok(FieldValue::Timestamp(instant.with_timezone(&Utc)))
            }
            _ => Err(format!("ambiguous wall-clock timestamp {text:?}")),
        };
    }
    Err(format!(
        "expected epoch milliseconds or a wall-clock string, got {}",
        json_kind(value)
    ))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
