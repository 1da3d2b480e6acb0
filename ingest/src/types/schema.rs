use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bail;
use crate::error::{ErrorKind, IngestError, IngestResult};

/// Physical column type enforced by the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    String,
    Int64,
    Float64,
    Bool,
    Bytes,
    Timestamp,
    Date,
    Time,
    DateTime,
    Json,
    Record,
}

impl PhysicalType {
    /// Standard SQL name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhysicalType::String => "STRING",
            PhysicalType::Int64 => "INT64",
            PhysicalType::Float64 => "FLOAT64",
            PhysicalType::Bool => "BOOL",
            PhysicalType::Bytes => "BYTES",
            PhysicalType::Timestamp => "TIMESTAMP",
            PhysicalType::Date => "DATE",
            PhysicalType::Time => "TIME",
            PhysicalType::DateTime => "DATETIME",
            PhysicalType::Json => "JSON",
            PhysicalType::Record => "RECORD",
        }
    }
}

impl fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhysicalType {
    type Err = IngestError;

    /// Parses both standard SQL and legacy REST type names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let physical_type = match s.to_ascii_uppercase().as_str() {
            "STRING" => PhysicalType::String,
            "INT64" | "INTEGER" => PhysicalType::Int64,
            "FLOAT64" | "FLOAT" => PhysicalType::Float64,
            "BOOL" | "BOOLEAN" => PhysicalType::Bool,
            "BYTES" => PhysicalType::Bytes,
            "TIMESTAMP" => PhysicalType::Timestamp,
            "DATE" => PhysicalType::Date,
            "TIME" => PhysicalType::Time,
            "DATETIME" => PhysicalType::DateTime,
            "JSON" => PhysicalType::Json,
            "RECORD" | "STRUCT" => PhysicalType::Record,
            other => bail!(
                ErrorKind::InvalidData,
                "Unsupported column type",
                format!("type `{other}` is not supported")
            ),
        };

        Ok(physical_type)
    }
}

impl Serialize for PhysicalType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PhysicalType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Column mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

/// Column of a [`TableSchema`].
///
/// `children` is non-empty exactly when `physical_type` is [`PhysicalType::Record`]; use
/// [`FieldDescriptor::validate`] to check descriptors built by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub physical_type: PhysicalType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(
        rename = "fields",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub children: Vec<FieldDescriptor>,
}

impl FieldDescriptor {
    /// Creates a `NULLABLE` scalar column.
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            mode: FieldMode::Nullable,
            children: Vec::new(),
        }
    }

    /// Creates a `NULLABLE` record column.
    pub fn record(name: impl Into<String>, children: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            physical_type: PhysicalType::Record,
            mode: FieldMode::Nullable,
            children,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn repeated(self) -> Self {
        self.with_mode(FieldMode::Repeated)
    }

    pub fn required(self) -> Self {
        self.with_mode(FieldMode::Required)
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }

    /// Returns the same descriptor describing a single element of a repeated column.
    pub fn element(&self) -> FieldDescriptor {
        FieldDescriptor {
            mode: FieldMode::Nullable,
            ..self.clone()
        }
    }

    /// Checks the record/children invariant recursively.
    pub fn validate(&self) -> IngestResult<()> {
        if self.name.is_empty() {
            bail!(ErrorKind::InvalidData, "Column name cannot be empty");
        }

        match (self.physical_type, self.children.is_empty()) {
            (PhysicalType::Record, true) => bail!(
                ErrorKind::InvalidData,
                "Record column has no children",
                format!("column `{}` is a RECORD without fields", self.name)
            ),
            (PhysicalType::Record, false) => {
                validate_unique_names(&self.children)?;
                self.children.iter().try_for_each(FieldDescriptor::validate)
            }
            (_, false) => bail!(
                ErrorKind::InvalidData,
                "Scalar column declares children",
                format!(
                    "column `{}` of type {} cannot have fields",
                    self.name, self.physical_type
                )
            ),
            (_, true) => Ok(()),
        }
    }
}

/// Ordered sequence of columns, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldDescriptor>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Validates every column and name uniqueness.
    pub fn validate(&self) -> IngestResult<()> {
        if self.fields.is_empty() {
            bail!(ErrorKind::InvalidData, "Table schema has no columns");
        }

        validate_unique_names(&self.fields)?;
        self.fields.iter().try_for_each(FieldDescriptor::validate)
    }
}

impl From<Vec<FieldDescriptor>> for TableSchema {
    fn from(fields: Vec<FieldDescriptor>) -> Self {
        Self::new(fields)
    }
}

fn validate_unique_names(fields: &[FieldDescriptor]) -> IngestResult<()> {
    for (index, field) in fields.iter().enumerate() {
        if fields[..index].iter().any(|other| other.name == field.name) {
            bail!(
                ErrorKind::InvalidData,
                "Duplicate column name",
                format!("column `{}` is declared more than once", field.name)
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_rest_schema_with_legacy_type_names() {
        let schema: TableSchema = serde_json::from_value(json!({
            "fields": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "meta", "type": "RECORD", "fields": [
                    {"name": "score", "type": "FLOAT"},
                    {"name": "ok", "type": "BOOLEAN"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(schema.fields[0].physical_type, PhysicalType::Int64);
        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert!(schema.fields[1].is_repeated());
        assert_eq!(schema.fields[2].mode, FieldMode::Nullable);
        assert_eq!(schema.fields[2].children[1].physical_type, PhysicalType::Bool);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn serializes_children_as_fields() {
        let field = FieldDescriptor::record(
            "items",
            vec![FieldDescriptor::new("sku", PhysicalType::String)],
        )
        .repeated();

        assert_eq!(
            serde_json::to_value(&field).unwrap(),
            json!({
                "name": "items",
                "type": "RECORD",
                "mode": "REPEATED",
                "fields": [{"name": "sku", "type": "STRING", "mode": "NULLABLE"}]
            })
        );
    }

    #[test]
    fn validate_rejects_broken_records_and_duplicates() {
        let empty_record = TableSchema::new(vec![FieldDescriptor::record("r", vec![])]);
        assert_eq!(
            empty_record.validate().unwrap_err().kind(),
            ErrorKind::InvalidData
        );

        let duplicate = TableSchema::new(vec![
            FieldDescriptor::new("a", PhysicalType::String),
            FieldDescriptor::new("a", PhysicalType::Int64),
        ]);
        assert!(duplicate.validate().is_err());

        let scalar_with_children = FieldDescriptor {
            children: vec![FieldDescriptor::new("x", PhysicalType::String)],
            ..FieldDescriptor::new("s", PhysicalType::String)
        };
        assert!(scalar_with_children.validate().is_err());
    }
}
