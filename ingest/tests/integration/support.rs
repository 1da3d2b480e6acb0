use ingest::types::{FieldDescriptor, PhysicalType, Row, TableSchema};
use serde_json::Value;

/// Schema of the ticket table used across the integration tests.
pub fn tickets_schema() -> TableSchema {
    TableSchema::new(vec![
        FieldDescriptor::new("id", PhysicalType::Int64),
        FieldDescriptor::new("status", PhysicalType::String),
        FieldDescriptor::new("tags", PhysicalType::String).repeated(),
    ])
}

pub fn ticket(id: i64, status: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("status", status)
        .with("tags", r#"["billing", "vip"]"#)
}

/// Stored rows as one JSON array, for compact assertions.
pub fn as_json(rows: Vec<serde_json::Map<String, Value>>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}
