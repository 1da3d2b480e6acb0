//! SQL rendering for table lifecycle and upsert statements.

use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::types::{
    FieldDescriptor, FieldMode, PartitionGranularity, PhysicalType, TableSchema, TableSpec,
    TimePartitioning,
};

/// Maximum number of clustering columns accepted by the warehouse.
pub const MAX_CLUSTERING_COLUMNS: usize = 4;

/// Sanitizes an identifier for safe backtick quoting.
///
/// Rejects empty identifiers and identifiers containing control characters. Backticks and
/// backslashes are escaped with a backslash so the value can be wrapped in backticks without
/// altering the identifier or allowing statement breaks.
pub fn sanitize_identifier(identifier: &str, context: &str) -> IngestResult<String> {
    if identifier.is_empty() {
        bail!(
            ErrorKind::InvalidIdentifier,
            "Invalid warehouse identifier",
            format!("{context} cannot be empty")
        );
    }

    if identifier.chars().any(char::is_control) {
        bail!(
            ErrorKind::InvalidIdentifier,
            "Invalid warehouse identifier",
            format!("{context} contains control characters")
        );
    }

    let mut escaped = String::with_capacity(identifier.len());
    for ch in identifier.chars() {
        match ch {
            '`' => escaped.push_str("\\`"),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(ch),
        }
    }

    Ok(escaped)
}

/// Returns the identifier sanitized and wrapped in backticks.
pub fn quote_identifier(identifier: &str, context: &str) -> IngestResult<String> {
    Ok(format!("`{}`", sanitize_identifier(identifier, context)?))
}

/// Returns the fully qualified table name, `` `project.dataset.table` ``.
pub fn full_table_name(project_id: &str, dataset_id: &str, table_id: &str) -> IngestResult<String> {
    let project_id = sanitize_identifier(project_id, "project id")?;
    let dataset_id = sanitize_identifier(dataset_id, "dataset id")?;
    let table_id = sanitize_identifier(table_id, "table id")?;

    Ok(format!("`{project_id}.{dataset_id}.{table_id}`"))
}

/// SQL type of a column, including `array<..>` for repeated columns.
pub fn column_type(field: &FieldDescriptor) -> IngestResult<String> {
    let element_type = match field.physical_type {
        PhysicalType::Record => {
            let children = field
                .children
                .iter()
                .map(|child| {
                    let name = quote_identifier(&child.name, "struct field name")?;
                    let mut spec = format!("{name} {}", column_type(child)?);
                    if child.mode == FieldMode::Required {
                        spec.push_str(" not null");
                    }
                    Ok(spec)
                })
                .collect::<IngestResult<Vec<_>>>()?;

            format!("struct<{}>", children.join(", "))
        }
        other => other.as_str().to_ascii_lowercase(),
    };

    if field.is_repeated() {
        return Ok(format!("array<{element_type}>"));
    }

    Ok(element_type)
}

/// Generates the SQL specification of one column for `create table` statements.
fn column_spec(field: &FieldDescriptor) -> IngestResult<String> {
    let column_name = quote_identifier(&field.name, "column name")?;
    let mut column_spec = format!("{column_name} {}", column_type(field)?);

    if field.mode == FieldMode::Required {
        column_spec.push_str(" not null");
    }

    Ok(column_spec)
}

fn partition_clause(partitioning: &TimePartitioning, schema: &TableSchema) -> IngestResult<String> {
    let granularity = partitioning.granularity.as_str();

    let Some(column) = &partitioning.field else {
        return Ok(match partitioning.granularity {
            PartitionGranularity::Hour => "partition by timestamp_trunc(_PARTITIONTIME, HOUR)".to_string(),
            PartitionGranularity::Day => "partition by _PARTITIONDATE".to_string(),
            _ => format!("partition by date_trunc(_PARTITIONDATE, {granularity})"),
        });
    };

    let field = schema.field(column).ok_or_else(|| {
        ingest_error!(
            ErrorKind::InvalidData,
            "Partitioning column is not part of the schema",
            format!("column `{column}` does not exist")
        )
    })?;
    let name = quote_identifier(column, "partitioning column")?;

    let clause = match (field.physical_type, partitioning.granularity) {
        (PhysicalType::Date, PartitionGranularity::Day) => format!("partition by {name}"),
        (PhysicalType::Date, PartitionGranularity::Hour) => bail!(
            ErrorKind::InvalidData,
            "Invalid partitioning granularity",
            format!("DATE column `{column}` cannot be partitioned by hour")
        ),
        (PhysicalType::Date, _) => format!("partition by date_trunc({name}, {granularity})"),
        (PhysicalType::Timestamp, _) => {
            format!("partition by timestamp_trunc({name}, {granularity})")
        }
        (PhysicalType::DateTime, _) => {
            format!("partition by datetime_trunc({name}, {granularity})")
        }
        (other, _) => bail!(
            ErrorKind::InvalidData,
            "Invalid partitioning column type",
            format!("column `{column}` of type {other} cannot partition a table")
        ),
    };

    Ok(clause)
}

fn cluster_clause(clustering: &[String], schema: &TableSchema) -> IngestResult<String> {
    if clustering.len() > MAX_CLUSTERING_COLUMNS {
        bail!(
            ErrorKind::InvalidData,
            "Too many clustering columns",
            format!(
                "{} clustering columns given, at most {MAX_CLUSTERING_COLUMNS} are allowed",
                clustering.len()
            )
        );
    }

    let columns = clustering
        .iter()
        .map(|column| {
            if schema.field(column).is_none() {
                bail!(
                    ErrorKind::InvalidData,
                    "Clustering column is not part of the schema",
                    format!("column `{column}` does not exist")
                );
            }
            quote_identifier(column, "clustering column")
        })
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(format!("cluster by {}", columns.join(", ")))
}

fn expiration_option(expiration: SystemTime) -> String {
    let expiration: DateTime<Utc> = expiration.into();

    format!(
        "options (expiration_timestamp = timestamp '{}')",
        expiration.format("%Y-%m-%d %H:%M:%S%.6f+00")
    )
}

/// Builds a `create table` statement for `spec`.
pub fn create_table_sql(full_table_name: &str, spec: &TableSpec) -> IngestResult<String> {
    spec.schema.validate()?;

    let columns = spec
        .schema
        .fields
        .iter()
        .map(column_spec)
        .collect::<IngestResult<Vec<_>>>()?
        .join(", ");

    let mut query = format!("create table {full_table_name} ({columns})");

    if let Some(partitioning) = &spec.partitioning {
        query.push(' ');
        query.push_str(&partition_clause(partitioning, &spec.schema)?);
    }

    if !spec.clustering.is_empty() {
        query.push(' ');
        query.push_str(&cluster_clause(&spec.clustering, &spec.schema)?);
    }

    if let Some(expiration) = spec.expiration {
        query.push(' ');
        query.push_str(&expiration_option(expiration));
    }

    Ok(query)
}

/// Builds a query listing the base tables of a dataset.
pub fn list_tables_sql(project_id: &str, dataset_id: &str) -> IngestResult<String> {
    let project_id = sanitize_identifier(project_id, "project id")?;
    let dataset_id = sanitize_identifier(dataset_id, "dataset id")?;

    Ok(format!(
        "select table_name from `{project_id}.{dataset_id}.INFORMATION_SCHEMA.TABLES` order by table_name"
    ))
}

/// A `MERGE` of a staging table into a target table, matching rows on key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub target_table: String,
    pub staging_table: String,
    pub key_columns: Vec<String>,
    pub update_columns: Vec<String>,
    pub insert_columns: Vec<String>,
}

impl MergeStatement {
    /// Renders the statement against tables of `project_id.dataset_id`.
    pub fn to_sql(&self, project_id: &str, dataset_id: &str) -> IngestResult<String> {
        if self.key_columns.is_empty() {
            bail!(ErrorKind::InvalidData, "Merge requires at least one key column");
        }

        let target = full_table_name(project_id, dataset_id, &self.target_table)?;
        let staging = full_table_name(project_id, dataset_id, &self.staging_table)?;

        let on_clause = self
            .key_columns
            .iter()
            .map(|column| {
                let column = quote_identifier(column, "merge key column")?;
                Ok(format!("target.{column} = source.{column}"))
            })
            .collect::<IngestResult<Vec<_>>>()?
            .join(" AND ");

        let set_clause = self
            .update_columns
            .iter()
            .map(|column| {
                let column = quote_identifier(column, "merge update column")?;
                Ok(format!("{column} = source.{column}"))
            })
            .collect::<IngestResult<Vec<_>>>()?
            .join(", ");

        let insert_columns = self
            .insert_columns
            .iter()
            .map(|column| quote_identifier(column, "merge insert column"))
            .collect::<IngestResult<Vec<_>>>()?;
        let insert_values = insert_columns
            .iter()
            .map(|column| format!("source.{column}"))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "MERGE {target} AS target USING {staging} AS source\n\
             ON {on_clause}\n\
             WHEN MATCHED THEN UPDATE SET {set_clause}\n\
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({insert_values})",
            insert_columns.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldDescriptor::new("id", PhysicalType::Int64).required(),
            FieldDescriptor::new("created_at", PhysicalType::Timestamp),
            FieldDescriptor::new("tags", PhysicalType::String).repeated(),
            FieldDescriptor::record(
                "customer",
                vec![
                    FieldDescriptor::new("name", PhysicalType::String),
                    FieldDescriptor::new("visits", PhysicalType::Int64).repeated(),
                ],
            ),
        ])
    }

    #[test]
    fn sanitize_identifier_escapes_and_rejects() {
        assert_eq!(sanitize_identifier("a`b\\c", "t").unwrap(), "a\\`b\\\\c");
        assert_eq!(
            sanitize_identifier("", "table id").unwrap_err().kind(),
            ErrorKind::InvalidIdentifier
        );
        assert!(sanitize_identifier("bad\nname", "table id").is_err());
    }

    #[test]
    fn create_table_renders_nested_types_and_hints() {
        let spec = TableSpec::new(schema())
            .with_partitioning(Some(TimePartitioning {
                field: Some("created_at".to_string()),
                granularity: PartitionGranularity::Day,
            }))
            .with_clustering(vec!["id".to_string()])
            .with_expiration(UNIX_EPOCH + Duration::from_secs(3600));

        let sql = create_table_sql("`p.d.t`", &spec).unwrap();

        assert_eq!(
            sql,
            "create table `p.d.t` (`id` int64 not null, `created_at` timestamp, \
             `tags` array<string>, `customer` struct<`name` string, `visits` array<int64>>) \
             partition by timestamp_trunc(`created_at`, DAY) cluster by `id` \
             options (expiration_timestamp = timestamp '1970-01-01 01:00:00.000000+00')"
        );
    }

    #[test]
    fn partitioning_and_clustering_are_validated() {
        let unknown_partition = TableSpec::new(schema()).with_partitioning(Some(TimePartitioning {
            field: Some("missing".to_string()),
            granularity: PartitionGranularity::Day,
        }));
        assert_eq!(
            create_table_sql("`p.d.t`", &unknown_partition)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidData
        );

        let string_partition = TableSpec::new(schema()).with_partitioning(Some(TimePartitioning {
            field: Some("tags".to_string()),
            granularity: PartitionGranularity::Day,
        }));
        assert!(create_table_sql("`p.d.t`", &string_partition).is_err());

        let unknown_cluster = TableSpec::new(schema()).with_clustering(vec!["nope".to_string()]);
        assert!(create_table_sql("`p.d.t`", &unknown_cluster).is_err());
    }

    #[test]
    fn ingestion_time_partitioning() {
        let spec = TableSpec::new(schema()).with_partitioning(Some(TimePartitioning::default()));

        assert!(
            create_table_sql("`p.d.t`", &spec)
                .unwrap()
                .ends_with("partition by _PARTITIONDATE")
        );
    }

    #[test]
    fn merge_statement_shape() {
        let statement = MergeStatement {
            target_table: "tickets".to_string(),
            staging_table: "tickets__stg_0000abcd".to_string(),
            key_columns: vec!["id".to_string(), "source".to_string()],
            update_columns: vec!["status".to_string()],
            insert_columns: vec!["id".to_string(), "source".to_string(), "status".to_string()],
        };

        assert_eq!(
            statement.to_sql("proj", "ds").unwrap(),
            "MERGE `proj.ds.tickets` AS target USING `proj.ds.tickets__stg_0000abcd` AS source\n\
             ON target.`id` = source.`id` AND target.`source` = source.`source`\n\
             WHEN MATCHED THEN UPDATE SET `status` = source.`status`\n\
             WHEN NOT MATCHED THEN INSERT (`id`, `source`, `status`) \
             VALUES (source.`id`, source.`source`, source.`status`)"
        );
    }

    #[test]
    fn merge_without_keys_is_rejected() {
        let statement = MergeStatement {
            target_table: "t".to_string(),
            staging_table: "s".to_string(),
            key_columns: vec![],
            update_columns: vec!["a".to_string()],
            insert_columns: vec!["a".to_string()],
        };

        assert_eq!(
            statement.to_sql("p", "d").unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }
}
