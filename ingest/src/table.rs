//! Dataset and table lifecycle on top of a [`Warehouse`].

use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::types::{
    DynamicValue, FieldDescriptor, Mapping, PhysicalType, Row, TableSchema, TableSpec,
    TimePartitioning,
};
use crate::warehouse::Warehouse;

/// Layout hints applied when a table has to be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableHints {
    pub partitioning: Option<TimePartitioning>,
    pub clustering: Vec<String>,
}

/// Existence checks and creation of the dataset and its tables.
///
/// Existing tables are never altered: their schema is authoritative.
#[derive(Debug, Clone)]
pub struct TableManager<W> {
    warehouse: W,
    force_nullable_columns: Vec<String>,
}

impl<W: Warehouse> TableManager<W> {
    pub fn new(warehouse: W) -> Self {
        Self {
            warehouse,
            force_nullable_columns: Vec::new(),
        }
    }

    /// Columns that schema inference always declares `NULLABLE`.
    pub fn with_force_nullable_columns(mut self, columns: Vec<String>) -> Self {
        self.force_nullable_columns = columns;
        self
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub async fn dataset_exists(&self) -> IngestResult<bool> {
        self.warehouse.dataset_exists().await
    }

    /// Creates the dataset unless it exists, in `location` or the warehouse default.
    pub async fn ensure_dataset(&self, location: Option<&str>) -> IngestResult<()> {
        if self.warehouse.dataset_exists().await? {
            return Ok(());
        }

        let location = location.unwrap_or(self.warehouse.location());
        match self.warehouse.create_dataset(location).await {
            Ok(()) => {
                info!(dataset = self.warehouse.dataset_id(), %location, "created dataset");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::DatasetAlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn table_exists(&self, table: &str) -> IngestResult<bool> {
        self.warehouse.table_exists(table).await
    }

    pub async fn table_schema(&self, table: &str) -> IngestResult<Option<TableSchema>> {
        self.warehouse.table_schema(table).await
    }

    /// Makes sure `table` exists and returns its effective schema.
    ///
    /// An existing table is left untouched and its own schema is returned. A missing table is
    /// created from `schema`, or from a schema inferred from `sample_rows` when `schema` is
    /// `None`. Losing a creation race to another caller counts as success.
    pub async fn ensure_table(
        &self,
        table: &str,
        schema: Option<&TableSchema>,
        sample_rows: &[Row],
        hints: &TableHints,
    ) -> IngestResult<TableSchema> {
        if let Some(existing) = self.warehouse.table_schema(table).await? {
            debug!(%table, "table already exists");
            return Ok(existing);
        }

        let schema = match schema {
            Some(schema) => schema.clone(),
            None if !sample_rows.is_empty() => {
                let inferred = infer_schema(sample_rows, &self.force_nullable_columns);
                if inferred.is_empty() {
                    bail!(
                        ErrorKind::SchemaRequired,
                        "Schema required",
                        format!("table `{table}` is missing and the sample rows have no columns")
                    );
                }
                inferred
            }
            None => bail!(
                ErrorKind::SchemaRequired,
                "Schema required",
                format!("table `{table}` is missing and neither a schema nor sample rows were given")
            ),
        };

        let spec = TableSpec::new(schema.clone())
            .with_partitioning(hints.partitioning.clone())
            .with_clustering(hints.clustering.clone());

        match self.create_table(table, &spec).await {
            Ok(()) => Ok(schema),
            Err(err) if err.kind() == ErrorKind::TableAlreadyExists => {
                debug!(%table, "table was created concurrently");
                Ok(self.warehouse.table_schema(table).await?.unwrap_or(schema))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create_table(&self, table: &str, spec: &TableSpec) -> IngestResult<()> {
        self.warehouse.create_table(table, spec).await?;

        info!(%table, columns = spec.schema.len(), "created table");

        Ok(())
    }

    pub async fn delete_table(&self, table: &str) -> IngestResult<()> {
        self.warehouse.delete_table(table).await?;

        info!(%table, "deleted table");

        Ok(())
    }

    pub async fn list_tables(&self) -> IngestResult<Vec<String>> {
        self.warehouse.list_tables().await
    }
}

/// Derives a schema from sample rows.
///
/// Columns are collected across all rows in first-seen order and the first non-null value of
/// a column decides its type. Columns named in `force_nullable` are never `REPEATED`.
pub fn infer_schema(rows: &[Row], force_nullable: &[String]) -> TableSchema {
    TableSchema::new(infer_fields(rows.iter(), force_nullable))
}

fn infer_fields<'a>(
    samples: impl Iterator<Item = &'a Mapping>,
    force_nullable: &[String],
) -> Vec<FieldDescriptor> {
    let mut columns: Vec<(&str, Option<&DynamicValue>)> = Vec::new();

    for sample in samples {
        for (name, value) in sample.iter() {
            let value = Some(value).filter(|value| !value.is_null());
            match columns.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, slot @ None)) => *slot = value,
                Some(_) => {}
                None => columns.push((name, value)),
            }
        }
    }

    columns
        .into_iter()
        .map(|(name, value)| {
            let force_nullable = force_nullable.iter().any(|column| column == name);
            infer_field(name, value, force_nullable)
        })
        .collect()
}

fn infer_field(name: &str, value: Option<&DynamicValue>, force_nullable: bool) -> FieldDescriptor {
    match value {
        Some(DynamicValue::Sequence(_)) if force_nullable => {
            FieldDescriptor::new(name, PhysicalType::String)
        }
        Some(DynamicValue::Sequence(elements)) => {
            let first = elements.iter().find(|element| !element.is_null());
            let element = match first {
                Some(DynamicValue::Mapping(_)) => {
                    let mappings = elements.iter().filter_map(|element| match element {
                        DynamicValue::Mapping(mapping) => Some(mapping),
                        _ => None,
                    });
                    record_or_string(name, infer_fields(mappings, &[]))
                }
                Some(element) => FieldDescriptor::new(name, scalar_type(element)),
                None => FieldDescriptor::new(name, PhysicalType::String),
            };

            element.repeated()
        }
        Some(DynamicValue::Mapping(mapping)) => {
            record_or_string(name, infer_fields(std::iter::once(mapping), &[]))
        }
        Some(value) => FieldDescriptor::new(name, scalar_type(value)),
        None => FieldDescriptor::new(name, PhysicalType::String),
    }
}

/// An empty mapping cannot be a record, so it is stored as text.
fn record_or_string(name: &str, children: Vec<FieldDescriptor>) -> FieldDescriptor {
    if children.is_empty() {
        FieldDescriptor::new(name, PhysicalType::String)
    } else {
        FieldDescriptor::record(name, children)
    }
}

fn scalar_type(value: &DynamicValue) -> PhysicalType {
    match value {
        DynamicValue::Bool(_) => PhysicalType::Bool,
        DynamicValue::Int(_) => PhysicalType::Int64,
        DynamicValue::Float(_) => PhysicalType::Float64,
        DynamicValue::Bytes(_) => PhysicalType::Bytes,
        DynamicValue::Timestamp(_) => PhysicalType::Timestamp,
        DynamicValue::DateTime(_) => PhysicalType::DateTime,
        DynamicValue::Date(_) => PhysicalType::Date,
        DynamicValue::Time(_) => PhysicalType::Time,
        // Nested sequences cannot be repeated again.
        DynamicValue::Null
        | DynamicValue::Str(_)
        | DynamicValue::Sequence(_)
        | DynamicValue::Mapping(_) => PhysicalType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldMode;
    use crate::warehouse::MemoryWarehouse;
    use chrono::NaiveDate;

    fn ticket_rows() -> Vec<Row> {
        vec![
            Row::new()
                .with("id", 1)
                .with("score", DynamicValue::Null)
                .with("tags", vec!["a", "b"])
                .with("requester", Row::new().with("name", "ana").with("vip", true))
                .with(
                    "comments",
                    DynamicValue::Sequence(vec![
                        Row::new().with("body", "hi").into(),
                        Row::new().with("author_id", 7).into(),
                    ]),
                )
                .with("custom_fields", DynamicValue::Sequence(vec![Row::new().with("x", 1).into()])),
            Row::new()
                .with("id", 2)
                .with("score", 0.5)
                .with("created", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
        ]
    }

    #[test]
    fn infers_types_across_sample_rows() {
        let schema = infer_schema(&ticket_rows(), &["custom_fields".to_string()]);

        assert_eq!(
            schema,
            TableSchema::new(vec![
                FieldDescriptor::new("id", PhysicalType::Int64),
                FieldDescriptor::new("score", PhysicalType::Float64),
                FieldDescriptor::new("tags", PhysicalType::String).repeated(),
                FieldDescriptor::record(
                    "requester",
                    vec![
                        FieldDescriptor::new("name", PhysicalType::String),
                        FieldDescriptor::new("vip", PhysicalType::Bool),
                    ]
                ),
                FieldDescriptor::record(
                    "comments",
                    vec![
                        FieldDescriptor::new("body", PhysicalType::String),
                        FieldDescriptor::new("author_id", PhysicalType::Int64),
                    ]
                )
                .repeated(),
                FieldDescriptor::new("custom_fields", PhysicalType::String),
                FieldDescriptor::new("created", PhysicalType::Date),
            ])
        );
    }

    #[test]
    fn empty_and_null_samples_fall_back_to_strings() {
        let rows = vec![
            Row::new()
                .with("nothing", DynamicValue::Null)
                .with("empty_list", DynamicValue::Sequence(Vec::new()))
                .with("empty_map", Row::new()),
        ];

        let schema = infer_schema(&rows, &[]);

        assert_eq!(
            schema.fields,
            vec![
                FieldDescriptor::new("nothing", PhysicalType::String),
                FieldDescriptor::new("empty_list", PhysicalType::String).repeated(),
                FieldDescriptor::new("empty_map", PhysicalType::String),
            ]
        );
        assert!(schema.validate().is_ok());
    }

    #[tokio::test]
    async fn ensure_table_without_schema_or_samples_requires_schema() {
        let manager = TableManager::new(MemoryWarehouse::new("p", "d"));

        let err = manager
            .ensure_table("tickets", None, &[], &TableHints::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SchemaRequired);
        assert!(!manager.table_exists("tickets").await.unwrap());
    }

    #[tokio::test]
    async fn ensure_table_creates_from_samples_then_keeps_existing_schema() {
        let manager = TableManager::new(MemoryWarehouse::new("p", "d"));
        let rows = vec![Row::new().with("id", 1)];

        let created = manager
            .ensure_table("tickets", None, &rows, &TableHints::default())
            .await
            .unwrap();
        let other = TableSchema::new(vec![FieldDescriptor::new("id", PhysicalType::String)]);
        let existing = manager
            .ensure_table("tickets", Some(&other), &[], &TableHints::default())
            .await
            .unwrap();

        assert_eq!(created.fields[0].physical_type, PhysicalType::Int64);
        assert_eq!(existing, created);
    }

    #[tokio::test]
    async fn ensure_table_applies_layout_hints() {
        let warehouse = MemoryWarehouse::new("p", "d");
        let manager = TableManager::new(warehouse.clone());
        let schema = TableSchema::new(vec![
            FieldDescriptor::new("id", PhysicalType::Int64).with_mode(FieldMode::Required),
            FieldDescriptor::new("created_at", PhysicalType::Timestamp),
        ]);
        let hints = TableHints {
            partitioning: Some(TimePartitioning {
                field: Some("created_at".to_string()),
                ..TimePartitioning::default()
            }),
            clustering: vec!["id".to_string()],
        };

        manager
            .ensure_table("events", Some(&schema), &[], &hints)
            .await
            .unwrap();

        let spec = warehouse.table_spec("events").await.unwrap();
        assert_eq!(spec.partitioning, hints.partitioning);
        assert_eq!(spec.clustering, hints.clustering);
    }

    #[tokio::test]
    async fn ensure_dataset_is_idempotent() {
        let manager = TableManager::new(MemoryWarehouse::without_dataset("p", "d"));

        assert!(!manager.dataset_exists().await.unwrap());
        manager.ensure_dataset(None).await.unwrap();
        manager.ensure_dataset(Some("US")).await.unwrap();
        assert!(manager.dataset_exists().await.unwrap());
    }

    #[tokio::test]
    async fn list_and_delete_tables() {
        let manager = TableManager::new(MemoryWarehouse::new("p", "d"));
        let schema = TableSchema::new(vec![FieldDescriptor::new("id", PhysicalType::Int64)]);
        for table in ["b", "a"] {
            manager
                .create_table(table, &TableSpec::new(schema.clone()))
                .await
                .unwrap();
        }

        manager.delete_table("b").await.unwrap();
        manager.delete_table("missing").await.unwrap();

        assert_eq!(manager.list_tables().await.unwrap(), vec!["a".to_string()]);
    }
}
