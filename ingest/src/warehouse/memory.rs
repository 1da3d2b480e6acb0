use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use arrow::record_batch::RecordBatch;
use config::shared::WarehouseConfig;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::bail;
use crate::decoding::record_batch_to_json_rows;
use crate::error::{ErrorKind, IngestResult, WriteError};
use crate::types::{
    LoadJobConfig, NormalizedRow, QueryResult, TableSchema, TableSpec, WriteDisposition,
};
use crate::warehouse::sql::{self, MergeStatement};
use crate::warehouse::Warehouse;

type JsonRow = Map<String, Value>;

#[derive(Debug)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<JsonRow>,
}

impl MemoryTable {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.spec
            .expiration
            .is_some_and(|expiration| expiration <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    dataset_exists: bool,
    tables: BTreeMap<String, MemoryTable>,
    queries: Vec<String>,
}

impl Inner {
    /// Drops tables whose expiration has passed, as the warehouse would.
    fn purge_expired(&mut self) {
        let now = SystemTime::now();
        self.tables.retain(|_, table| !table.is_expired(now));
    }

    fn table_mut(&mut self, table: &str) -> IngestResult<&mut MemoryTable> {
        self.purge_expired();

        match self.tables.get_mut(table) {
            Some(memory_table) => Ok(memory_table),
            None => bail!(
                ErrorKind::TableMissing,
                "Table not found",
                format!("table `{table}` does not exist")
            ),
        }
    }
}

/// In-process [`Warehouse`] storing rows as JSON objects.
///
/// Write dispositions, table expirations and `MERGE` semantics behave as in the real
/// warehouse, so ingestion flows can run end to end without network access.
#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    project_id: String,
    dataset_id: String,
    location: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    /// Creates a warehouse whose dataset already exists.
    pub fn new(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self::with_dataset_state(project_id.into(), dataset_id.into(), true)
    }

    /// Creates a warehouse whose dataset does not exist yet.
    pub fn without_dataset(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self::with_dataset_state(project_id.into(), dataset_id.into(), false)
    }

    fn with_dataset_state(project_id: String, dataset_id: String, dataset_exists: bool) -> Self {
        let inner = Inner {
            dataset_exists,
            ..Inner::default()
        };

        Self {
            project_id,
            dataset_id,
            location: WarehouseConfig::DEFAULT_LOCATION.to_string(),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns a copy of the rows stored in `table`, empty when the table does not exist.
    pub async fn rows(&self, table: &str) -> Vec<JsonRow> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();

        inner
            .tables
            .get(table)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// Returns the specification `table` was created with.
    pub async fn table_spec(&self, table: &str) -> Option<TableSpec> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();

        inner.tables.get(table).map(|table| table.spec.clone())
    }

    /// Returns every SQL statement executed so far, in order.
    pub async fn executed_queries(&self) -> Vec<String> {
        self.inner.lock().await.queries.clone()
    }
}

impl Warehouse for MemoryWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn dataset_exists(&self) -> IngestResult<bool> {
        Ok(self.inner.lock().await.dataset_exists)
    }

    async fn create_dataset(&self, location: &str) -> IngestResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.dataset_exists {
            bail!(
                ErrorKind::DatasetAlreadyExists,
                "Dataset already exists",
                format!("dataset `{}` already exists", self.dataset_id)
            );
        }

        inner.dataset_exists = true;
        info!(dataset = %self.dataset_id, %location, "created dataset in memory warehouse");

        Ok(())
    }

    async fn table_schema(&self, table: &str) -> IngestResult<Option<TableSchema>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();

        Ok(inner.tables.get(table).map(|table| table.spec.schema.clone()))
    }

    async fn create_table(&self, table: &str, spec: &TableSpec) -> IngestResult<()> {
        let full_table_name = sql::full_table_name(&self.project_id, &self.dataset_id, table)?;
        // Rejects the same specs the warehouse DDL would.
        sql::create_table_sql(&full_table_name, spec)?;

        let mut inner = self.inner.lock().await;
        if !inner.dataset_exists {
            bail!(
                ErrorKind::WarehouseQueryFailed,
                "Dataset not found",
                format!("dataset `{}` does not exist", self.dataset_id)
            );
        }

        inner.purge_expired();
        if inner.tables.contains_key(table) {
            bail!(
                ErrorKind::TableAlreadyExists,
                "Table already exists",
                format!("table {full_table_name} already exists")
            );
        }

        inner.tables.insert(
            table.to_string(),
            MemoryTable {
                spec: spec.clone(),
                rows: Vec::new(),
            },
        );

        Ok(())
    }

    async fn delete_table(&self, table: &str) -> IngestResult<()> {
        self.inner.lock().await.tables.remove(table);

        Ok(())
    }

    async fn list_tables(&self) -> IngestResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();

        Ok(inner.tables.keys().cloned().collect())
    }

    async fn append_batch(&self, table: &str, batch: &RecordBatch) -> Result<(), WriteError> {
        let rows = record_batch_to_json_rows(batch)?;

        let mut inner = self.inner.lock().await;
        let memory_table = inner.table_mut(table)?;

        for field in batch.schema().fields() {
            if memory_table.spec.schema.field(field.name()).is_none() {
                return Err(WriteError::new(format!(
                    "no such field `{}` in table `{table}`",
                    field.name()
                )));
            }
        }

        memory_table.rows.extend(rows);

        Ok(())
    }

    async fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[NormalizedRow],
        config: &LoadJobConfig,
    ) -> IngestResult<u64> {
        let rows: Vec<JsonRow> = rows.iter().map(|row| row.to_json(schema)).collect();
        let loaded = rows.len() as u64;

        let mut inner = self.inner.lock().await;
        let memory_table = inner.table_mut(table)?;
        match config.write_disposition {
            WriteDisposition::Append => memory_table.rows.extend(rows),
            WriteDisposition::Truncate => memory_table.rows = rows,
        }

        Ok(loaded)
    }

    async fn query(&self, sql: &str) -> IngestResult<QueryResult> {
        self.inner.lock().await.queries.push(sql.to_string());

        Ok(QueryResult::default())
    }

    async fn merge(&self, statement: &MergeStatement) -> IngestResult<u64> {
        let rendered = statement.to_sql(&self.project_id, &self.dataset_id)?;

        let mut inner = self.inner.lock().await;
        inner.queries.push(rendered);

        let source_rows = inner.table_mut(&statement.staging_table)?.rows.clone();
        let target = inner.table_mut(&statement.target_table)?;

        let original_len = target.rows.len();
        let mut matched_targets = HashSet::new();
        let mut inserted = Vec::new();
        let mut affected = 0u64;

        for source in &source_rows {
            let Some(source_key) = key_of(source, &statement.key_columns) else {
                inserted.push(project(source, &statement.insert_columns));
                affected += 1;
                continue;
            };

            let matched = target.rows[..original_len]
                .iter()
                .position(|row| key_of(row, &statement.key_columns).as_ref() == Some(&source_key));

            match matched {
                Some(index) => {
                    if !matched_targets.insert(index) {
                        bail!(
                            ErrorKind::MergeFailure,
                            "MERGE matched a target row more than once",
                            format!("key {source_key:?} occurs several times in the source")
                        );
                    }

                    for column in &statement.update_columns {
                        let value = source.get(column).cloned().unwrap_or(Value::Null);
                        target.rows[index].insert(column.clone(), value);
                    }
                }
                None => inserted.push(project(source, &statement.insert_columns)),
            }
            affected += 1;
        }

        target.rows.extend(inserted);

        Ok(affected)
    }
}

/// Returns the key values of `row`, or `None` when any of them is null.
fn key_of(row: &JsonRow, key_columns: &[String]) -> Option<Vec<Value>> {
    key_columns
        .iter()
        .map(|column| match row.get(column) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        })
        .collect()
}

fn project(row: &JsonRow, columns: &[String]) -> JsonRow {
    columns
        .iter()
        .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
        .collect()
}
