//! Test helpers: tracing setup and a [`Warehouse`] wrapper injecting failures.

use std::sync::{Arc, Mutex, Once};

use arrow::record_batch::RecordBatch;

use crate::error::{ErrorKind, IngestError, IngestResult, WriteError};
use crate::ingest_error;
use crate::types::{LoadJobConfig, NormalizedRow, QueryResult, TableSchema, TableSpec};
use crate::warehouse::{MergeStatement, Warehouse};

static INIT_TRACING: Once = Once::new();

/// Installs a formatting subscriber honouring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Calls observed by a [`FaultyWarehouse`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarehouseCalls {
    pub create_table: usize,
    pub delete_table: usize,
    pub append_batch: usize,
    pub load_rows: usize,
    pub merge: usize,
    /// Row count of every appended batch, in call order.
    pub appended_batch_sizes: Vec<usize>,
    /// Row count and disposition of every load job, in call order.
    pub loads: Vec<(String, usize, LoadJobConfig)>,
}

#[derive(Debug, Default)]
struct Faults {
    append: Option<WriteError>,
    /// Zero-based index of the only append call that fails, `None` failing all of them.
    append_at: Option<usize>,
    load: Option<IngestError>,
    merge: Option<IngestError>,
    delete: Option<IngestError>,
}

#[derive(Debug, Default)]
struct State {
    faults: Faults,
    calls: WarehouseCalls,
}

/// Wraps a [`Warehouse`], counting calls and failing them on demand.
#[derive(Debug, Clone)]
pub struct FaultyWarehouse<W> {
    inner: W,
    state: Arc<Mutex<State>>,
}

impl<W> FaultyWarehouse<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Fails every streaming append with `error`.
    pub fn fail_appends(&self, error: WriteError) {
        let mut state = self.lock();
        state.faults.append = Some(error);
        state.faults.append_at = None;
    }

    /// Fails only the `call`-th streaming append with `error`.
    pub fn fail_append_at(&self, call: usize, error: WriteError) {
        let mut state = self.lock();
        state.faults.append = Some(error);
        state.faults.append_at = Some(call);
    }

    pub fn fail_loads(&self, message: &'static str) {
        self.lock().faults.load = Some(ingest_error!(ErrorKind::LoadJobFailure, message));
    }

    pub fn fail_merges(&self, message: &'static str) {
        self.lock().faults.merge = Some(ingest_error!(ErrorKind::WarehouseQueryFailed, message));
    }

    pub fn fail_deletes(&self, message: &'static str) {
        self.lock().faults.delete = Some(ingest_error!(ErrorKind::WarehouseQueryFailed, message));
    }

    /// Removes every injected failure.
    pub fn heal(&self) {
        self.lock().faults = Faults::default();
    }

    pub fn calls(&self) -> WarehouseCalls {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Warehouse> Warehouse for FaultyWarehouse<W> {
    fn project_id(&self) -> &str {
        self.inner.project_id()
    }

    fn dataset_id(&self) -> &str {
        self.inner.dataset_id()
    }

    fn location(&self) -> &str {
        self.inner.location()
    }

    async fn dataset_exists(&self) -> IngestResult<bool> {
        self.inner.dataset_exists().await
    }

    async fn create_dataset(&self, location: &str) -> IngestResult<()> {
        self.inner.create_dataset(location).await
    }

    async fn table_schema(&self, table: &str) -> IngestResult<Option<TableSchema>> {
        self.inner.table_schema(table).await
    }

    async fn create_table(&self, table: &str, spec: &TableSpec) -> IngestResult<()> {
        self.lock().calls.create_table += 1;

        self.inner.create_table(table, spec).await
    }

    async fn delete_table(&self, table: &str) -> IngestResult<()> {
        let fault = {
            let mut state = self.lock();
            state.calls.delete_table += 1;
            state.faults.delete.clone()
        };
        if let Some(error) = fault {
            return Err(error);
        }

        self.inner.delete_table(table).await
    }

    async fn list_tables(&self) -> IngestResult<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn append_batch(&self, table: &str, batch: &RecordBatch) -> Result<(), WriteError> {
        let fault = {
            let mut state = self.lock();
            let call = state.calls.append_batch;
            state.calls.append_batch += 1;
            state.calls.appended_batch_sizes.push(batch.num_rows());

            match state.faults.append_at {
                Some(failing_call) if failing_call != call => None,
                _ => state.faults.append.clone(),
            }
        };
        if let Some(error) = fault {
            return Err(error);
        }

        self.inner.append_batch(table, batch).await
    }

    async fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[NormalizedRow],
        config: &LoadJobConfig,
    ) -> IngestResult<u64> {
        let fault = {
            let mut state = self.lock();
            state.calls.load_rows += 1;
            state.calls.loads.push((table.to_string(), rows.len(), *config));
            state.faults.load.clone()
        };
        if let Some(error) = fault {
            return Err(error);
        }

        self.inner.load_rows(table, schema, rows, config).await
    }

    async fn query(&self, sql: &str) -> IngestResult<QueryResult> {
        self.inner.query(sql).await
    }

    async fn merge(&self, statement: &MergeStatement) -> IngestResult<u64> {
        let fault = {
            let mut state = self.lock();
            state.calls.merge += 1;
            state.faults.merge.clone()
        };
        if let Some(error) = fault {
            return Err(error);
        }

        self.inner.merge(statement).await
    }
}
