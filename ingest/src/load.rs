//! Whole-batch writes through warehouse load jobs.

use metrics::counter;
use tracing::info;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::metrics::{INGEST_ROWS_TOTAL, PATH_LABEL, TABLE_NAME_LABEL, register_metrics};
use crate::table::{TableHints, TableManager};
use crate::types::{LoadJobConfig, NormalizedRow, TableSchema, WriteDisposition};
use crate::warehouse::Warehouse;

/// Submits normalized rows as one load job.
///
/// Slower than streaming but tolerant of unknown values and quoted newlines, which makes it
/// the fallback when streaming fails.
#[derive(Debug, Clone)]
pub struct BatchLoadFallback<W> {
    tables: TableManager<W>,
}

impl<W: Warehouse + Clone> BatchLoadFallback<W> {
    pub fn new(warehouse: W) -> Self {
        Self {
            tables: TableManager::new(warehouse),
        }
    }

    /// Loads `rows` into `table` with `disposition`, returning the number of rows loaded.
    ///
    /// With `create_if_absent` a missing table is first created from `schema`.
    pub async fn load_rows(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        schema: &TableSchema,
        disposition: WriteDisposition,
        create_if_absent: bool,
    ) -> IngestResult<u64> {
        register_metrics();

        if create_if_absent {
            self.tables
                .ensure_table(table, Some(schema), &[], &TableHints::default())
                .await?;
        }

        let config = LoadJobConfig::new(disposition);
        let loaded = self
            .tables
            .warehouse()
            .load_rows(table, schema, rows, &config)
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::LoadJobFailure {
                    err
                } else {
                    ingest_error!(
                        ErrorKind::LoadJobFailure,
                        "Load job failed",
                        format!("table `{table}`"),
                        source: err
                    )
                }
            })?;

        counter!(
            INGEST_ROWS_TOTAL,
            PATH_LABEL => "load",
            TABLE_NAME_LABEL => table.to_string()
        )
        .increment(loaded);

        info!(%table, rows = loaded, %disposition, "load job completed");

        Ok(loaded)
    }
}
