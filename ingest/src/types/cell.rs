use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde_json::{Map, Value};

use crate::types::schema::{FieldDescriptor, TableSchema};
use crate::types::value::DynamicValue;

/// Days between 0001-01-01 and 1970-01-01, as counted by [`chrono::Datelike::num_days_from_ce`].
pub(crate) const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Value coerced to the physical type of its column.
///
/// [`Cell::Unconverted`] keeps inputs that could not be coerced so the warehouse reports them
/// instead of the value being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    String(String),
    I64(i64),
    F64(f64),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(String),
    /// Record values aligned with the children of the column descriptor.
    Record(Vec<Cell>),
    /// Elements of a repeated column.
    Array(Vec<Cell>),
    Unconverted(DynamicValue),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Renders the cell as the JSON accepted by streaming inserts and load jobs.
    pub fn to_json(&self, field: &FieldDescriptor) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(value) => Value::Bool(*value),
            Cell::String(value) | Cell::Json(value) => Value::String(value.clone()),
            Cell::I64(value) => Value::from(*value),
            Cell::F64(value) => float_to_json(*value),
            Cell::Bytes(value) => Value::String(BASE64_STANDARD.encode(value)),
            Cell::Timestamp(value) => Value::String(format_timestamp(value)),
            Cell::DateTime(value) => Value::String(format_datetime(value)),
            Cell::Date(value) => Value::String(format_date(value)),
            Cell::Time(value) => Value::String(format_time(value)),
            Cell::Record(values) => {
                let mut object = Map::with_capacity(values.len());
                for (child, value) in field.children.iter().zip(values) {
                    object.insert(child.name.clone(), value.to_json(child));
                }
                Value::Object(object)
            }
            Cell::Array(values) => {
                let element = field.element();
                Value::Array(values.iter().map(|value| value.to_json(&element)).collect())
            }
            Cell::Unconverted(value) => value.to_json(),
        }
    }
}

/// A row whose values are aligned, by position, with the columns of a [`TableSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub values: Vec<Cell>,
}

impl NormalizedRow {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }

    /// Renders the row as a JSON object keyed by column name.
    pub fn to_json(&self, schema: &TableSchema) -> Map<String, Value> {
        schema
            .fields
            .iter()
            .zip(&self.values)
            .map(|(field, cell)| (field.name.clone(), cell.to_json(field)))
            .collect()
    }
}

/// Renders a float, falling back to a string for values JSON cannot represent.
pub(crate) fn float_to_json(value: f64) -> Value {
    match serde_json::Number::from_f64(value) {
        Some(number) => Value::Number(number),
        None if value.is_nan() => Value::String("NaN".to_string()),
        None if value.is_sign_positive() => Value::String("Infinity".to_string()),
        None => Value::String("-Infinity".to_string()),
    }
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn format_datetime(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub(crate) fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub(crate) fn format_time(value: &NaiveTime) -> String {
    value.format("%H:%M:%S%.6f").to_string()
}

/// Microseconds elapsed since midnight.
pub(crate) fn time_to_micros(value: &NaiveTime) -> i64 {
    i64::from(value.num_seconds_from_midnight()) * 1_000_000 + i64::from(value.nanosecond() / 1_000)
}

/// Inverse of [`time_to_micros`].
pub(crate) fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    let seconds = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
}
