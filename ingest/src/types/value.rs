use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

/// Loosely typed value produced by upstream extraction.
///
/// Values may arrive structured, or as JSON text standing in for a structure; the normalizer
/// reconciles both against the declared schema.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<FixedOffset>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Sequence(Vec<DynamicValue>),
    Mapping(Mapping),
}

impl DynamicValue {
    /// Returns `true` for [`DynamicValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    /// Converts the value into JSON.
    ///
    /// Temporal values render as ISO-8601 strings and bytes as lossy UTF-8 text.
    pub fn to_json(&self) -> Value {
        match self {
            DynamicValue::Null => Value::Null,
            DynamicValue::Bool(value) => Value::Bool(*value),
            DynamicValue::Int(value) => Value::from(*value),
            DynamicValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(value.to_string())),
            DynamicValue::Str(value) => Value::String(value.clone()),
            DynamicValue::Bytes(value) => Value::String(String::from_utf8_lossy(value).into_owned()),
            DynamicValue::Timestamp(value) => Value::String(value.to_rfc3339()),
            DynamicValue::DateTime(value) => {
                Value::String(value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            DynamicValue::Date(value) => Value::String(value.format("%Y-%m-%d").to_string()),
            DynamicValue::Time(value) => Value::String(value.format("%H:%M:%S%.f").to_string()),
            DynamicValue::Sequence(values) => {
                Value::Array(values.iter().map(DynamicValue::to_json).collect())
            }
            DynamicValue::Mapping(mapping) => mapping.to_json(),
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::Int(_) => "int",
            DynamicValue::Float(_) => "float",
            DynamicValue::Str(_) => "string",
            DynamicValue::Bytes(_) => "bytes",
            DynamicValue::Timestamp(_) => "timestamp",
            DynamicValue::DateTime(_) => "datetime",
            DynamicValue::Date(_) => "date",
            DynamicValue::Time(_) => "time",
            DynamicValue::Sequence(_) => "sequence",
            DynamicValue::Mapping(_) => "mapping",
        }
    }
}

impl From<Value> for DynamicValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => DynamicValue::Null,
            Value::Bool(value) => DynamicValue::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => DynamicValue::Int(value),
                None => DynamicValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(value) => DynamicValue::Str(value),
            Value::Array(values) => {
                DynamicValue::Sequence(values.into_iter().map(DynamicValue::from).collect())
            }
            Value::Object(object) => DynamicValue::Mapping(
                object
                    .into_iter()
                    .map(|(key, value)| (key, DynamicValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Bool(value)
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Int(value)
    }
}

impl From<i32> for DynamicValue {
    fn from(value: i32) -> Self {
        DynamicValue::Int(value.into())
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        DynamicValue::Float(value)
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::Str(value.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::Str(value)
    }
}

impl From<DateTime<FixedOffset>> for DynamicValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        DynamicValue::Timestamp(value)
    }
}

impl From<DateTime<chrono::Utc>> for DynamicValue {
    fn from(value: DateTime<chrono::Utc>) -> Self {
        DynamicValue::Timestamp(value.fixed_offset())
    }
}

impl From<NaiveDateTime> for DynamicValue {
    fn from(value: NaiveDateTime) -> Self {
        DynamicValue::DateTime(value)
    }
}

impl From<NaiveDate> for DynamicValue {
    fn from(value: NaiveDate) -> Self {
        DynamicValue::Date(value)
    }
}

impl From<NaiveTime> for DynamicValue {
    fn from(value: NaiveTime) -> Self {
        DynamicValue::Time(value)
    }
}

impl From<Mapping> for DynamicValue {
    fn from(value: Mapping) -> Self {
        DynamicValue::Mapping(value)
    }
}

impl<T> From<Option<T>> for DynamicValue
where
    T: Into<DynamicValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DynamicValue::Null)
    }
}

impl<T> From<Vec<T>> for DynamicValue
where
    T: Into<DynamicValue>,
{
    fn from(values: Vec<T>) -> Self {
        DynamicValue::Sequence(values.into_iter().map(Into::into).collect())
    }
}

/// Insertion-ordered string-keyed mapping.
///
/// Keys are unique: inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: Vec<(String, DynamicValue)>,
}

/// A row handed over by upstream extraction.
pub type Row = Mapping;

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DynamicValue>) {
        let key = key.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`Mapping::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DynamicValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DynamicValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Converts the mapping into a JSON object preserving key order.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl<K, V> FromIterator<(K, V)> for Mapping
where
    K: Into<String>,
    V: Into<DynamicValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = Mapping::new();
        for (key, value) in iter {
            mapping.insert(key, value);
        }
        mapping
    }
}

impl From<serde_json::Map<String, Value>> for Mapping {
    fn from(object: serde_json::Map<String, Value>) -> Self {
        object.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_objects_keep_key_order() {
        let value = DynamicValue::from(json!({"zeta": 1, "alpha": [true, null, 1.5]}));

        let DynamicValue::Mapping(mapping) = &value else {
            panic!("expected a mapping");
        };
        assert_eq!(mapping.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(
            mapping.get("alpha"),
            Some(&DynamicValue::Sequence(vec![
                DynamicValue::Bool(true),
                DynamicValue::Null,
                DynamicValue::Float(1.5),
            ]))
        );
        assert_eq!(value.to_json(), json!({"zeta": 1, "alpha": [true, null, 1.5]}));
    }

    #[test]
    fn insert_replaces_existing_keys_in_place() {
        let mut row = Row::new().with("a", 1).with("b", "x");
        row.insert("a", 2);

        assert_eq!(row.len(), 2);
        assert_eq!(row.get("a"), Some(&DynamicValue::Int(2)));
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
