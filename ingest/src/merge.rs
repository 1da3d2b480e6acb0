//! Upserts through an ephemeral staging table and a single `MERGE`.

use std::time::{Duration, SystemTime};

use config::shared::IngestConfig;
use metrics::counter;
use tracing::{info, warn};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::load::BatchLoadFallback;
use crate::metrics::{
    INGEST_ROWS_TOTAL, INGEST_STAGING_CLEANUP_FAILURES_TOTAL, PATH_LABEL, TABLE_NAME_LABEL,
    register_metrics,
};
use crate::normalize::normalize_rows;
use crate::table::{TableHints, TableManager};
use crate::types::{NormalizedRow, Row, TableSchema, TableSpec, UpsertResult, WriteDisposition};
use crate::warehouse::{MergeStatement, Warehouse};

/// Returns a fresh staging table name for `table`: `<table>__stg_<8 hex digits>`.
pub fn staging_table_name(table: &str) -> String {
    format!("{table}__stg_{:08x}", rand::random::<u32>())
}

/// Updates rows matching on key columns and inserts the others.
///
/// Each call owns a uniquely named staging table that expires on its own and is deleted when
/// the call ends, whether the merge succeeded or not.
#[derive(Debug, Clone)]
pub struct MergeUpserter<W> {
    tables: TableManager<W>,
    loader: BatchLoadFallback<W>,
    staging_expiration: Duration,
}

impl<W: Warehouse + Clone> MergeUpserter<W> {
    pub fn new(warehouse: W) -> Self {
        Self {
            tables: TableManager::new(warehouse.clone()),
            loader: BatchLoadFallback::new(warehouse),
            staging_expiration: Duration::from_secs(IngestConfig::DEFAULT_STAGING_EXPIRATION_SECS),
        }
    }

    pub fn from_config(warehouse: W, config: &IngestConfig) -> Self {
        Self::new(warehouse)
            .with_staging_expiration(Duration::from_secs(config.staging_expiration_secs))
    }

    pub fn with_staging_expiration(mut self, staging_expiration: Duration) -> Self {
        self.staging_expiration = staging_expiration;
        self
    }

    /// Upserts `rows` into `table`, creating the table from `schema` when it is missing.
    ///
    /// Rows are normalized against the table's effective schema. Without `update_columns`
    /// every non-key column is updated.
    pub async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        schema: &TableSchema,
        key_columns: &[String],
        update_columns: Option<&[String]>,
    ) -> IngestResult<UpsertResult> {
        let schema = self
            .tables
            .ensure_table(table, Some(schema), &[], &TableHints::default())
            .await?;
        let rows = normalize_rows(rows, &schema);

        self.upsert_normalized(table, &rows, &schema, key_columns, update_columns)
            .await
    }

    /// Upserts rows already normalized against `schema` into the existing `table`.
    pub async fn upsert_normalized(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        schema: &TableSchema,
        key_columns: &[String],
        update_columns: Option<&[String]>,
    ) -> IngestResult<UpsertResult> {
        register_metrics();

        let statement_columns = merge_columns(schema, key_columns, update_columns)?;
        if rows.is_empty() {
            return Ok(UpsertResult {
                total_rows: 0,
                affected_rows: 0,
            });
        }

        let staging_table = staging_table_name(table);
        let statement = MergeStatement {
            target_table: table.to_string(),
            staging_table: staging_table.clone(),
            key_columns: key_columns.to_vec(),
            update_columns: statement_columns.update,
            insert_columns: statement_columns.insert,
        };

        let outcome = self.stage_and_merge(&statement, rows, schema).await;
        if let Err(err) = self.cleanup_staging(table, &staging_table).await {
            counter!(
                INGEST_STAGING_CLEANUP_FAILURES_TOTAL,
                TABLE_NAME_LABEL => table.to_string()
            )
            .increment(1);

            warn!(
                %table,
                %staging_table,
                error = %err,
                "failed to delete staging table, leaving it to expire"
            );
        }
        let affected_rows = outcome?;

        counter!(
            INGEST_ROWS_TOTAL,
            PATH_LABEL => "merge",
            TABLE_NAME_LABEL => table.to_string()
        )
        .increment(rows.len() as u64);

        info!(
            %table,
            %staging_table,
            rows = rows.len(),
            affected_rows,
            "merge completed"
        );

        Ok(UpsertResult {
            total_rows: rows.len() as u64,
            affected_rows,
        })
    }

    async fn stage_and_merge(
        &self,
        statement: &MergeStatement,
        rows: &[NormalizedRow],
        schema: &TableSchema,
    ) -> IngestResult<u64> {
        let staging_table = &statement.staging_table;
        let expiration = SystemTime::now() + self.staging_expiration;
        let spec = TableSpec::new(schema.clone()).with_expiration(expiration);

        self.tables
            .create_table(staging_table, &spec)
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::MergeFailure,
                    "Staging table creation failed",
                    format!("staging table `{staging_table}`"),
                    source: err
                )
            })?;

        self.loader
            .load_rows(staging_table, rows, schema, WriteDisposition::Truncate, false)
            .await?;

        self.tables
            .warehouse()
            .merge(statement)
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::MergeFailure,
                    "Merge into target table failed",
                    format!("`{staging_table}` into `{}`", statement.target_table),
                    source: err
                )
            })
    }

    /// Deletes the staging table. A failure is classified but never fails the upsert.
    async fn cleanup_staging(&self, table: &str, staging_table: &str) -> IngestResult<()> {
        self.tables
            .delete_table(staging_table)
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::StagingCleanupFailure,
                    "Staging table cleanup failed",
                    format!("`{staging_table}` for `{table}`"),
                    source: err
                )
            })
    }
}

#[derive(Debug)]
struct MergeColumns {
    update: Vec<String>,
    insert: Vec<String>,
}

/// Resolves the columns a merge updates and inserts.
///
/// Update columns default to every non-key column, or to the keys themselves when the schema
/// only has keys.
fn merge_columns(
    schema: &TableSchema,
    key_columns: &[String],
    update_columns: Option<&[String]>,
) -> IngestResult<MergeColumns> {
    if key_columns.is_empty() {
        bail!(ErrorKind::InvalidData, "Upsert requires at least one key column");
    }

    let unknown = key_columns
        .iter()
        .chain(update_columns.unwrap_or_default())
        .find(|column| schema.field(column).is_none());
    if let Some(column) = unknown {
        bail!(
            ErrorKind::InvalidData,
            "Upsert column is not in the schema",
            format!("column `{column}` does not exist")
        );
    }

    let update = match update_columns {
        Some(columns) if !columns.is_empty() => columns.to_vec(),
        _ => {
            let non_keys: Vec<String> = schema
                .column_names()
                .filter(|name| !key_columns.iter().any(|key| key.as_str() == *name))
                .map(str::to_string)
                .collect();

            if non_keys.is_empty() {
                key_columns.to_vec()
            } else {
                non_keys
            }
        }
    };

    Ok(MergeColumns {
        update,
        insert: schema.column_names().map(str::to_string).collect(),
    })
}
