//! Schema-directed coercion of loosely typed rows.
//!
//! A single recursive pass walks each [`FieldDescriptor`] against the matching value of a
//! [`Row`] and produces a [`NormalizedRow`] aligned with the schema. Missing values become
//! [`Cell::Null`] (or an empty array for repeated columns). Values that cannot be coerced are
//! kept as [`Cell::Unconverted`] so the warehouse rejects them visibly.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;

use crate::json::{clean_json_text, to_canonical_string};
use crate::types::{
    Cell, DynamicValue, FieldDescriptor, Mapping, NormalizedRow, PhysicalType, Row, TableSchema,
};

/// Offset-aware formats accepted for timestamp strings.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Naive formats accepted for timestamp strings, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Normalizes every row against `schema`.
pub fn normalize_rows(rows: &[Row], schema: &TableSchema) -> Vec<NormalizedRow> {
    rows.iter().map(|row| normalize_row(row, schema)).collect()
}

/// Normalizes one row against `schema`; keys not declared by the schema are ignored.
pub fn normalize_row(row: &Row, schema: &TableSchema) -> NormalizedRow {
    NormalizedRow::new(
        schema
            .fields
            .iter()
            .map(|field| normalize_value(field, row.get(&field.name)))
            .collect(),
    )
}

/// Normalizes the value of one column, `None` meaning the key was absent.
pub fn normalize_value(field: &FieldDescriptor, value: Option<&DynamicValue>) -> Cell {
    if field.is_repeated() {
        let element = field.element();
        let elements = repeated_elements(field, value);
        return Cell::Array(
            elements
                .iter()
                .map(|value| normalize_scalar(&element, value))
                .collect(),
        );
    }

    match value {
        None => Cell::Null,
        Some(value) => normalize_scalar(field, value),
    }
}

/// Collects the raw elements of a repeated column.
fn repeated_elements(field: &FieldDescriptor, value: Option<&DynamicValue>) -> Vec<DynamicValue> {
    match value {
        None | Some(DynamicValue::Null) => Vec::new(),
        Some(DynamicValue::Sequence(values)) => values.clone(),
        Some(DynamicValue::Str(text)) => {
            let is_record = field.physical_type == PhysicalType::Record;
            try_recover_encoded_sequence(text, is_record)
                .unwrap_or_else(|| vec![DynamicValue::Str(text.clone())])
        }
        Some(other) => vec![other.clone()],
    }
}

/// Recovers the elements of a repeated column that arrived as JSON text.
///
/// This works around upstream producers that stringify structured values, sometimes twice.
/// The fallback order is:
///
/// 1. Blank text is an empty sequence.
/// 2. Text decoding to an array yields its elements. When every element is a single-character
///    string the array is a stringified sequence split into characters: the characters are
///    re-joined and decoded once more, and the re-joined form is used only if it decodes to an
///    array (or, for record columns, an object). Otherwise the first decoded array is kept.
/// 3. For record columns, text decoding to an object yields a one-element sequence.
/// 4. Anything else returns `None` and the caller wraps the literal text.
///
/// The re-join cannot tell a stringified sequence from a genuine array of single characters
/// that happens to spell valid JSON: `["[", "]"]` recovers as an empty sequence.
pub fn try_recover_encoded_sequence(text: &str, is_record: bool) -> Option<Vec<DynamicValue>> {
    if text.trim().is_empty() {
        return Some(Vec::new());
    }

    match decode_structured(text, is_record)? {
        DynamicValue::Sequence(values) if is_character_fragments(&values) => {
            let joined: String = values
                .iter()
                .filter_map(|value| match value {
                    DynamicValue::Str(fragment) => Some(fragment.as_str()),
                    _ => None,
                })
                .collect();

            match decode_structured(&joined, is_record) {
                Some(DynamicValue::Sequence(recovered)) => Some(recovered),
                Some(mapping @ DynamicValue::Mapping(_)) => Some(vec![mapping]),
                _ => Some(values),
            }
        }
        DynamicValue::Sequence(values) => Some(values),
        mapping @ DynamicValue::Mapping(_) => Some(vec![mapping]),
        _ => None,
    }
}

/// Decodes `text` into an array, or an object when `accept_object` is set.
fn decode_structured(text: &str, accept_object: bool) -> Option<DynamicValue> {
    let value: Value = serde_json::from_str(clean_json_text(text)).ok()?;

    match value {
        Value::Array(_) => Some(DynamicValue::from(value)),
        Value::Object(_) if accept_object => Some(DynamicValue::from(value)),
        _ => None,
    }
}

fn is_character_fragments(values: &[DynamicValue]) -> bool {
    values.len() > 1
        && values
            .iter()
            .all(|value| matches!(value, DynamicValue::Str(s) if s.chars().count() == 1))
}

/// Coerces a single (non-repeated) value to the physical type of `field`.
pub fn normalize_scalar(field: &FieldDescriptor, value: &DynamicValue) -> Cell {
    if value.is_null() {
        return Cell::Null;
    }

    match field.physical_type {
        PhysicalType::String => Cell::String(to_display_string(value)),
        PhysicalType::Json => Cell::Json(to_json_text(value)),
        PhysicalType::Bytes => match value {
            DynamicValue::Bytes(bytes) => Cell::Bytes(bytes.clone()),
            DynamicValue::Str(text) => Cell::Bytes(text.as_bytes().to_vec()),
            other => Cell::Unconverted(other.clone()),
        },
        PhysicalType::Int64 => coerce_int(value),
        PhysicalType::Float64 => coerce_float(value),
        PhysicalType::Bool => coerce_bool(value),
        PhysicalType::Timestamp => match to_instant(value) {
            Some(instant) => Cell::Timestamp(instant),
            None => Cell::Unconverted(value.clone()),
        },
        PhysicalType::DateTime => match to_instant(value) {
            Some(instant) => Cell::DateTime(instant.naive_utc()),
            None => Cell::Unconverted(value.clone()),
        },
        PhysicalType::Date => match to_date(value) {
            Some(date) => Cell::Date(date),
            None => Cell::Unconverted(value.clone()),
        },
        PhysicalType::Time => match to_time(value) {
            Some(time) => Cell::Time(time),
            None => Cell::Unconverted(value.clone()),
        },
        PhysicalType::Record => match value {
            DynamicValue::Mapping(mapping) => normalize_record(field, mapping),
            DynamicValue::Str(text) => match decode_object(text) {
                Some(mapping) => normalize_record(field, &mapping),
                None => Cell::Unconverted(value.clone()),
            },
            other => Cell::Unconverted(other.clone()),
        },
    }
}

fn normalize_record(field: &FieldDescriptor, mapping: &Mapping) -> Cell {
    Cell::Record(
        field
            .children
            .iter()
            .map(|child| normalize_value(child, mapping.get(&child.name)))
            .collect(),
    )
}

fn decode_object(text: &str) -> Option<Mapping> {
    match serde_json::from_str::<Value>(clean_json_text(text)).ok()? {
        Value::Object(object) => Some(Mapping::from(object)),
        _ => None,
    }
}

/// String form of any value.
///
/// Scalars follow the usual textual form (`True`, `1.0`, `123`), structures render as
/// canonical JSON.
pub fn to_display_string(value: &DynamicValue) -> String {
    match value {
        DynamicValue::Null => "None".to_string(),
        DynamicValue::Bool(true) => "True".to_string(),
        DynamicValue::Bool(false) => "False".to_string(),
        DynamicValue::Int(value) => value.to_string(),
        DynamicValue::Float(value) => format_float(*value),
        DynamicValue::Str(value) => value.clone(),
        DynamicValue::Bytes(value) => String::from_utf8_lossy(value).into_owned(),
        DynamicValue::Timestamp(value) => value.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        DynamicValue::DateTime(value) => value.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        DynamicValue::Date(value) => value.format("%Y-%m-%d").to_string(),
        DynamicValue::Time(value) => value.format("%H:%M:%S%.f").to_string(),
        DynamicValue::Sequence(_) | DynamicValue::Mapping(_) => {
            to_canonical_string(&value.to_json())
        }
    }
}

/// Formats a float keeping a fractional part on integral values (`3.0`).
fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        let text = if value.is_sign_positive() { "inf" } else { "-inf" };
        text.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Canonical JSON text of any value.
///
/// Strings are re-parsed so equivalent documents share one formatting; text that is not JSON
/// is serialized as a JSON string.
fn to_json_text(value: &DynamicValue) -> String {
    match value {
        DynamicValue::Str(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => to_canonical_string(&parsed),
            Err(_) => to_canonical_string(&Value::String(text.clone())),
        },
        other => to_canonical_string(&other.to_json()),
    }
}

fn coerce_int(value: &DynamicValue) -> Cell {
    match value {
        DynamicValue::Int(value) => Cell::I64(*value),
        DynamicValue::Float(float) if is_exact_integer(*float) => Cell::I64(*float as i64),
        DynamicValue::Str(text) => {
            let text = text.trim();
            if let Ok(parsed) = text.parse::<i64>() {
                return Cell::I64(parsed);
            }
            match text.parse::<f64>() {
                Ok(float) if is_exact_integer(float) => Cell::I64(float as i64),
                _ => Cell::Unconverted(value.clone()),
            }
        }
        other => Cell::Unconverted(other.clone()),
    }
}

/// `i64::MAX as f64` rounds up to 2^63, so the upper bound is exclusive.
fn is_exact_integer(value: f64) -> bool {
    const I64_UPPER_BOUND: f64 = 9_223_372_036_854_775_808.0;

    value.is_finite()
        && value.fract() == 0.0
        && value >= -I64_UPPER_BOUND
        && value < I64_UPPER_BOUND
}

fn coerce_float(value: &DynamicValue) -> Cell {
    match value {
        DynamicValue::Float(value) => Cell::F64(*value),
        DynamicValue::Int(value) => Cell::F64(*value as f64),
        DynamicValue::Str(text) => match text.trim().parse::<f64>() {
            Ok(parsed) => Cell::F64(parsed),
            Err(_) => Cell::Unconverted(value.clone()),
        },
        other => Cell::Unconverted(other.clone()),
    }
}

fn coerce_bool(value: &DynamicValue) -> Cell {
    match value {
        DynamicValue::Bool(value) => Cell::Bool(*value),
        DynamicValue::Int(value) => Cell::Bool(*value != 0),
        DynamicValue::Str(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Cell::Bool(true),
            "false" | "f" | "0" | "no" | "n" => Cell::Bool(false),
            _ => Cell::Unconverted(value.clone()),
        },
        other => Cell::Unconverted(other.clone()),
    }
}

/// Converts a value to an absolute instant, assuming UTC for naive inputs.
fn to_instant(value: &DynamicValue) -> Option<DateTime<Utc>> {
    match value {
        DynamicValue::Timestamp(value) => Some(value.to_utc()),
        DynamicValue::DateTime(value) => Some(value.and_utc()),
        DynamicValue::Date(value) => value.and_hms_opt(0, 0, 0).map(|value| value.and_utc()),
        DynamicValue::Str(text) => parse_timestamp(text).map(|value| value.to_utc()),
        _ => None,
    }
}

/// Parses ISO-8601 style timestamps with `T` or space separators.
///
/// Accepts an offset, a trailing `Z` or ` UTC`, or no zone at all (UTC assumed). A bare date
/// means midnight.
pub fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    let utc = FixedOffset::east_opt(0)?;

    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }

    let naive_text = text
        .strip_suffix(" UTC")
        .or_else(|| text.strip_suffix('Z'))
        .or_else(|| text.strip_suffix('z'))
        .unwrap_or(text);

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive_text, format) {
            return Some(parsed.and_utc().with_timezone(&utc));
        }
    }

    NaiveDate::parse_from_str(naive_text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|value| value.and_utc().with_timezone(&utc))
}

fn to_date(value: &DynamicValue) -> Option<NaiveDate> {
    match value {
        DynamicValue::Date(value) => Some(*value),
        DynamicValue::DateTime(value) => Some(value.date()),
        DynamicValue::Timestamp(value) => Some(value.date_naive()),
        DynamicValue::Str(text) => {
            let date_part = text.trim().split(['T', ' ']).next()?;
            NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
        }
        _ => None,
    }
}

fn to_time(value: &DynamicValue) -> Option<NaiveTime> {
    match value {
        DynamicValue::Time(value) => Some(*value),
        DynamicValue::DateTime(value) => Some(value.time()),
        DynamicValue::Timestamp(value) => Some(value.time()),
        DynamicValue::Str(text) => {
            let text = text.trim();
            if let Some(timestamp) = parse_timestamp(text)
                && text.len() > "YYYY-MM-DD".len()
            {
                return Some(timestamp.time());
            }

            ["%H:%M:%S%.f", "%H:%M"]
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
        }
        _ => None,
    }
}
