//! Warehouse transport abstraction and its implementations.

mod bigquery;
mod memory;
pub mod sql;
mod storage;
mod write_client;

use std::future::Future;

use arrow::record_batch::RecordBatch;

use crate::error::{IngestResult, WriteError};
use crate::types::{LoadJobConfig, NormalizedRow, QueryResult, TableSchema, TableSpec};

pub use bigquery::BigQueryWarehouse;
pub use memory::MemoryWarehouse;
pub use sql::MergeStatement;
pub use write_client::{DEFAULT_POLL_INTERVAL, TokenSource, WriteClient};

/// Operations the ingestion core needs from an analytical warehouse.
///
/// A [`Warehouse`] is bound to one project and one dataset; every table argument is a bare
/// table id within that dataset. Implementations must be safe to share between concurrent
/// callers.
pub trait Warehouse: Send + Sync {
    fn project_id(&self) -> &str;

    fn dataset_id(&self) -> &str;

    /// Location new datasets and jobs are placed in.
    fn location(&self) -> &str;

    fn dataset_exists(&self) -> impl Future<Output = IngestResult<bool>> + Send;

    /// Creates the dataset in `location`.
    ///
    /// Fails with [`crate::error::ErrorKind::DatasetAlreadyExists`] when it is already present.
    fn create_dataset(&self, location: &str) -> impl Future<Output = IngestResult<()>> + Send;

    /// Returns the schema of `table`, or `None` when the table does not exist.
    fn table_schema(
        &self,
        table: &str,
    ) -> impl Future<Output = IngestResult<Option<TableSchema>>> + Send;

    fn table_exists(&self, table: &str) -> impl Future<Output = IngestResult<bool>> + Send {
        async move { Ok(self.table_schema(table).await?.is_some()) }
    }

    /// Creates `table`.
    ///
    /// Fails with [`crate::error::ErrorKind::TableAlreadyExists`] when it is already present.
    fn create_table(
        &self,
        table: &str,
        spec: &TableSpec,
    ) -> impl Future<Output = IngestResult<()>> + Send;

    /// Deletes `table`. Deleting a missing table succeeds.
    fn delete_table(&self, table: &str) -> impl Future<Output = IngestResult<()>> + Send;

    fn list_tables(&self) -> impl Future<Output = IngestResult<Vec<String>>> + Send;

    /// Appends one record batch through the streaming path.
    ///
    /// Row indexes reported in the [`WriteError`] are relative to `batch`.
    fn append_batch(
        &self,
        table: &str,
        batch: &RecordBatch,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Runs one load job writing `rows` into `table` and waits for it to finish.
    ///
    /// Returns the number of rows loaded.
    fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[NormalizedRow],
        config: &LoadJobConfig,
    ) -> impl Future<Output = IngestResult<u64>> + Send;

    /// Executes a pass-through SQL statement and waits for its result.
    fn query(&self, sql: &str) -> impl Future<Output = IngestResult<QueryResult>> + Send;

    /// Executes `statement`, returning the number of affected rows.
    fn merge(&self, statement: &MergeStatement) -> impl Future<Output = IngestResult<u64>> + Send {
        async move {
            let sql = statement.to_sql(self.project_id(), self.dataset_id())?;
            let result = self.query(&sql).await?;

            Ok(result.affected_rows.unwrap_or_default())
        }
    }
}
