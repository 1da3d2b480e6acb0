//! Entry point tying normalization, streaming, fallback and upserts together.

use std::path::Path;

use config::Environment;
use config::shared::{IngestConfig, IngestSettings, WarehouseConfig};
use metrics::counter;
use tracing::{error, info, warn};

use crate::bail;
use crate::clients::{BigQueryClientFactory, ClientCache};
use crate::credentials::{CredentialInput, CredentialProvider};
use crate::error::{ErrorKind, IngestResult};
use crate::load::BatchLoadFallback;
use crate::merge::MergeUpserter;
use crate::metrics::{INGEST_STREAMING_FALLBACKS_TOTAL, TABLE_NAME_LABEL, register_metrics};
use crate::normalize::normalize_rows;
use crate::streaming::StreamingWriter;
use crate::table::{TableHints, TableManager};
use crate::types::{IngestionResult, QueryResult, Row, TableSchema, WriteDisposition};
use crate::warehouse::{BigQueryWarehouse, Warehouse};

/// Options of one [`Ingestor::insert_rows`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOptions {
    /// Schema of the rows. When `None` the existing table's schema is used.
    pub schema: Option<TableSchema>,
    /// Key columns turning the call into an upsert. Empty means append.
    pub key_columns: Vec<String>,
    /// Columns updated on key matches, defaulting to every non-key column.
    pub update_columns: Option<Vec<String>>,
    /// Whether to create the table from `schema` when it is missing.
    pub ensure_table: bool,
    pub hints: TableHints,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            schema: None,
            key_columns: Vec::new(),
            update_columns: None,
            ensure_table: true,
            hints: TableHints::default(),
        }
    }
}

impl InsertOptions {
    pub fn with_schema(mut self, schema: TableSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Self {
        self.key_columns = key_columns;
        self
    }

    pub fn with_update_columns(mut self, update_columns: Vec<String>) -> Self {
        self.update_columns = Some(update_columns);
        self
    }

    pub fn with_ensure_table(mut self, ensure_table: bool) -> Self {
        self.ensure_table = ensure_table;
        self
    }

    pub fn with_hints(mut self, hints: TableHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Ingests row batches into tables of one dataset.
///
/// Appends go through the streaming path first and fall back to a single load job of the same
/// normalized rows when streaming fails. Calls with key columns are upserted instead.
#[derive(Debug, Clone)]
pub struct Ingestor<W> {
    tables: TableManager<W>,
    streaming: StreamingWriter<W>,
    loader: BatchLoadFallback<W>,
    upserter: MergeUpserter<W>,
}

impl<W: Warehouse + Clone> Ingestor<W> {
    pub fn new(warehouse: W) -> Self {
        Self::from_config(warehouse, &IngestConfig::default())
    }

    pub fn from_config(warehouse: W, config: &IngestConfig) -> Self {
        Self {
            tables: TableManager::new(warehouse.clone())
                .with_force_nullable_columns(config.force_nullable_columns.clone()),
            streaming: StreamingWriter::from_config(warehouse.clone(), config),
            loader: BatchLoadFallback::new(warehouse.clone()),
            upserter: MergeUpserter::from_config(warehouse, config),
        }
    }

    pub fn warehouse(&self) -> &W {
        self.tables.warehouse()
    }

    pub fn tables(&self) -> &TableManager<W> {
        &self.tables
    }

    pub fn upserter(&self) -> &MergeUpserter<W> {
        &self.upserter
    }

    /// Writes `rows` into `table`.
    ///
    /// An empty batch succeeds without touching the warehouse. A streaming failure is
    /// recovered by one load job and reported through [`IngestionResult::fallback_used`]; only
    /// a failing load job, upsert or table resolution is returned as an error.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[Row],
        options: &InsertOptions,
    ) -> IngestResult<IngestionResult> {
        if rows.is_empty() {
            return Ok(IngestionResult::streamed());
        }

        register_metrics();

        let schema = self.resolve_schema(table, options).await?;
        let normalized = normalize_rows(rows, &schema);

        if !options.key_columns.is_empty() {
            let upsert = self
                .upserter
                .upsert_normalized(
                    table,
                    &normalized,
                    &schema,
                    &options.key_columns,
                    options.update_columns.as_deref(),
                )
                .await?;

            return Ok(IngestionResult::upserted(upsert));
        }

        let Err(err) = self
            .streaming
            .append_normalized(table, &normalized, &schema)
            .await
        else {
            info!(%table, rows = normalized.len(), "streamed rows");
            return Ok(IngestionResult::streamed());
        };

        warn!(%table, error = %err, "streaming append failed, falling back to a load job");
        for row_error in &err.row_errors {
            error!(
                %table,
                row = row_error.index,
                error = %row_error.message,
                "row rejected by streaming append"
            );
        }
        counter!(INGEST_STREAMING_FALLBACKS_TOTAL, TABLE_NAME_LABEL => table.to_string())
            .increment(1);

        self.loader
            .load_rows(table, &normalized, &schema, WriteDisposition::Append, false)
            .await?;

        Ok(IngestionResult::fell_back(err.to_string()))
    }

    /// Runs a pass-through SQL statement.
    pub async fn query(&self, sql: &str) -> IngestResult<QueryResult> {
        self.warehouse().query(sql).await
    }

    async fn resolve_schema(&self, table: &str, options: &InsertOptions) -> IngestResult<TableSchema> {
        match &options.schema {
            Some(schema) if options.ensure_table => {
                self.tables.ensure_dataset(None).await?;
                self.tables
                    .ensure_table(table, Some(schema), &[], &options.hints)
                    .await
            }
            Some(schema) => Ok(schema.clone()),
            None => match self.tables.table_schema(table).await? {
                Some(existing) => Ok(existing),
                None => bail!(
                    ErrorKind::SchemaRequired,
                    "Schema required",
                    format!("table `{table}` does not exist and no schema was supplied")
                ),
            },
        }
    }
}

impl Ingestor<BigQueryWarehouse> {
    /// Builds an ingestor for the dataset of `warehouse_config`.
    ///
    /// The credential is resolved from `explicit` and the provider's sources, the configured
    /// key path replacing the default key file. Clients come from `cache`.
    pub async fn connect(
        cache: &ClientCache<BigQueryClientFactory>,
        provider: &CredentialProvider,
        explicit: Option<&CredentialInput>,
        warehouse_config: &WarehouseConfig,
        ingest_config: &IngestConfig,
    ) -> IngestResult<Self> {
        let path_hint = warehouse_config
            .credentials_path
            .as_deref()
            .map(std::path::Path::new);
        let credential = provider.resolve(explicit, path_hint)?;

        info!(
            identity = credential.identity(),
            source = %credential.source(),
            project = %warehouse_config.project_id,
            dataset = %warehouse_config.dataset_id,
            "connecting ingestor"
        );

        let warehouse = cache.warehouse(&credential, warehouse_config).await?;

        Ok(Self::from_config(warehouse, ingest_config))
    }

    /// Loads [`IngestSettings`] through [`load_settings`] and connects with them.
    pub async fn connect_from_configuration(
        cache: &ClientCache<BigQueryClientFactory>,
        provider: &CredentialProvider,
        explicit: Option<&CredentialInput>,
    ) -> IngestResult<Self> {
        let settings = load_settings()?;

        Self::connect(cache, provider, explicit, &settings.warehouse, &settings.ingest).await
    }
}

/// Loads the layered [`IngestSettings`] for the current environment.
pub fn load_settings() -> IngestResult<IngestSettings> {
    Ok(config::load_config::<IngestSettings>()?)
}

/// Loads [`IngestSettings`] from `directory` for `environment`.
pub fn load_settings_from(
    directory: &Path,
    environment: Environment,
) -> IngestResult<IngestSettings> {
    Ok(config::load_config_from::<IngestSettings>(directory, environment)?)
}
