use std::fmt;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::{
    AppendRowsResponse, append_rows_response,
};
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::field_type::FieldType;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::get_query_results_response::GetQueryResultsResponse;
use gcp_bigquery_client::model::job_reference::JobReference;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::QueryResponse;
use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::model::table_schema::TableSchema as BigQueryTableSchema;
use gcp_bigquery_client::storage::{StorageApi, StreamName};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, IngestResult, RowError, WriteError};
use crate::ingest_error;
use crate::types::{
    FieldDescriptor, FieldMode, LoadJobConfig, NormalizedRow, PhysicalType, QueryResult,
    TableSchema, TableSpec,
};
use crate::warehouse::Warehouse;
use crate::warehouse::sql;
use crate::warehouse::storage::{record_batch_to_storage_rows, table_descriptor};
use crate::warehouse::write_client::WriteClient;

/// Upper bound on how long the service holds a query request open waiting for completion.
const QUERY_TIMEOUT_MS: i32 = 10_000;

/// Payload limit of one append request, leaving room under the 10MB API limit for metadata.
const MAX_APPEND_REQUEST_BYTES: usize = 9 * 1024 * 1024;

/// Trace id attached to append requests.
const APPEND_TRACE_ID: &str = "ingest";

/// [`Warehouse`] backed by Google BigQuery.
///
/// Dataset, table and query operations go through the BigQuery client, and streaming appends
/// use its Storage Write API default stream. Load jobs go through the [`WriteClient`] sharing
/// the same credential.
#[derive(Clone)]
pub struct BigQueryWarehouse {
    client: Client,
    write_client: WriteClient,
    project_id: String,
    dataset_id: String,
    location: String,
}

impl BigQueryWarehouse {
    pub fn new(
        client: Client,
        write_client: WriteClient,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            client,
            write_client,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            location: location.into(),
        }
    }

    /// Returns a warehouse bound to another dataset, sharing the underlying clients.
    pub fn for_dataset(&self, dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            ..self.clone()
        }
    }

    fn full_table_name(&self, table: &str) -> IngestResult<String> {
        sql::full_table_name(&self.project_id, &self.dataset_id, table)
    }
}

impl fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("project_id", &self.project_id)
            .field("dataset_id", &self.dataset_id)
            .field("location", &self.location)
            .field("identity", &self.write_client.identity())
            .finish_non_exhaustive()
    }
}

impl Warehouse for BigQueryWarehouse {
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
        let result = self
            .client
            .dataset()
            .get(&self.project_id, &self.dataset_id)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(BQError::ResponseError { error }) if error.error.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_dataset(&self, location: &str) -> IngestResult<()> {
        info!(dataset = %self.dataset_id, %location, "creating dataset in bigquery");

        let dataset = Dataset::new(&self.project_id, &self.dataset_id).location(location);
        match self.client.dataset().create(dataset).await {
            Ok(_) => Ok(()),
            Err(BQError::ResponseError { error }) if error.error.code == 409 => bail!(
                ErrorKind::DatasetAlreadyExists,
                "Dataset already exists",
                format!("dataset `{}` already exists", self.dataset_id)
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn table_schema(&self, table: &str) -> IngestResult<Option<TableSchema>> {
        let result = self
            .client
            .table()
            .get(&self.project_id, &self.dataset_id, table, None)
            .await;

        let table_metadata = match result {
            Ok(table_metadata) => table_metadata,
            Err(BQError::ResponseError { error }) if error.error.code == 404 => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let fields = table_metadata.schema.fields.unwrap_or_default();
        let fields = fields
            .iter()
            .map(field_descriptor)
            .collect::<IngestResult<Vec<_>>>()
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::InvalidData,
                    "Table schema cannot be represented",
                    format!("table `{table}`"),
                    source: err
                )
            })?;

        Ok(Some(TableSchema::new(fields)))
    }

    async fn create_table(&self, table: &str, spec: &TableSpec) -> IngestResult<()> {
        let full_table_name = self.full_table_name(table)?;
        if self.table_exists(table).await? {
            bail!(
                ErrorKind::TableAlreadyExists,
                "Table already exists",
                format!("table {full_table_name} already exists")
            );
        }

        let ddl = sql::create_table_sql(&full_table_name, spec)?;
        info!(%full_table_name, "creating table in bigquery");

        match self.query(&ddl).await {
            Ok(_) => Ok(()),
            // Lost a creation race against another writer.
            Err(err) if err.kind() == ErrorKind::TableAlreadyExists => bail!(
                ErrorKind::TableAlreadyExists,
                "Table already exists",
                format!("table {full_table_name} already exists")
            ),
            Err(err) => Err(err),
        }
    }

    async fn delete_table(&self, table: &str) -> IngestResult<()> {
        let full_table_name = self.full_table_name(table)?;

        info!(%full_table_name, "dropping table from bigquery");

        self.query(&format!("drop table if exists {full_table_name}")).await?;

        Ok(())
    }

    async fn list_tables(&self) -> IngestResult<Vec<String>> {
        let query = sql::list_tables_sql(&self.project_id, &self.dataset_id)?;
        let result = self.query(&query).await?;

        Ok(result
            .rows
            .into_iter()
            .filter_map(|mut row| match row.remove("table_name") {
                Some(Value::String(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// Appends `batch` through the table's default write stream.
    ///
    /// Rows are split into requests under [`MAX_APPEND_REQUEST_BYTES`]; a failed request
    /// reports row errors relative to the whole batch.
    async fn append_batch(&self, table: &str, batch: &RecordBatch) -> Result<(), WriteError> {
        let descriptor = table_descriptor(&batch.schema())?;
        let rows = record_batch_to_storage_rows(batch)?;
        let stream_name = StreamName::new_default(
            self.project_id.clone(),
            self.dataset_id.clone(),
            table.to_string(),
        );

        let mut storage = self.client.storage().clone();
        let mut offset = 0;
        while offset < rows.len() {
            let (request_rows, processed) =
                StorageApi::create_rows(&descriptor, &rows[offset..], MAX_APPEND_REQUEST_BYTES);
            if processed == 0 {
                return Err(WriteError::with_row_errors(
                    "row exceeds the append request size limit",
                    vec![RowError {
                        index: offset,
                        message: format!("row is larger than {MAX_APPEND_REQUEST_BYTES} bytes"),
                    }],
                ));
            }

            let mut responses = storage
                .append_rows(&stream_name, request_rows, APPEND_TRACE_ID.to_string())
                .await
                .map_err(append_error)?;
            while let Some(response) = responses
                .message()
                .await
                .map_err(|status| append_error(BQError::from(status)))?
            {
                if let Some(err) = append_response_error(response) {
                    return Err(err.offset_rows(offset));
                }
            }

            debug!(%table, rows = processed, "appended rows to default stream");
            offset += processed;
        }

        Ok(())
    }

    async fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[NormalizedRow],
        config: &LoadJobConfig,
    ) -> IngestResult<u64> {
        let mut ndjson = String::new();
        for row in rows {
            ndjson.push_str(&serde_json::to_string(&row.to_json(schema))?);
            ndjson.push('\n');
        }

        self.write_client
            .run_load_job(
                &self.project_id,
                &self.dataset_id,
                table,
                &self.location,
                schema,
                ndjson,
                config,
            )
            .await
    }

    async fn query(&self, sql: &str) -> IngestResult<QueryResult> {
        let mut request = QueryRequest::new(sql);
        request.location = Some(self.location.clone());
        request.timeout_ms = Some(QUERY_TIMEOUT_MS);

        let response = self
            .client
            .job()
            .query(&self.project_id, request)
            .await?;

        let mut page = QueryPage::from(response);
        let mut result = QueryResult {
            rows: Vec::new(),
            affected_rows: page.affected_rows,
        };

        loop {
            result.rows.append(&mut page.rows);
            if page.complete && page.page_token.is_none() {
                break;
            }

            let Some(job_id) = page.job_id.take() else {
                bail!(
                    ErrorKind::WarehouseQueryFailed,
                    "Query response has no job reference",
                    "cannot poll an incomplete query without its job id"
                );
            };

            if !page.complete {
                debug!(%job_id, "query not complete yet, polling");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }

            let parameters = GetQueryResultsParameters {
                // An incomplete job has produced no page yet, so only follow tokens of
                // complete pages.
                page_token: page.page_token.take().filter(|_| page.complete),
                location: Some(self.location.clone()),
                timeout_ms: Some(QUERY_TIMEOUT_MS),
                ..Default::default()
            };
            let response = self
                .client
                .job()
                .get_query_results(&self.project_id, &job_id, parameters)
                .await?;

            page = QueryPage::from(response);
            if result.affected_rows.is_none() {
                result.affected_rows = page.affected_rows;
            }
        }

        Ok(result)
    }
}

fn append_error(err: BQError) -> WriteError {
    WriteError::new(format!("storage write append failed: {err}"))
}

/// Returns the failure carried by one append response, if any.
fn append_response_error(response: AppendRowsResponse) -> Option<WriteError> {
    if !response.row_errors.is_empty() {
        let row_errors: Vec<_> = response
            .row_errors
            .into_iter()
            .map(|row_error| RowError {
                index: usize::try_from(row_error.index).unwrap_or_default(),
                message: row_error.message,
            })
            .collect();

        return Some(WriteError::with_row_errors(
            format!("storage write rejected {} rows", row_errors.len()),
            row_errors,
        ));
    }

    match response.response {
        Some(append_rows_response::Response::Error(status)) => Some(WriteError::new(format!(
            "storage write append failed with code {}: {}",
            status.code, status.message
        ))),
        _ => None,
    }
}

/// Converts a column of the table resource into a [`FieldDescriptor`].
fn field_descriptor(field: &TableFieldSchema) -> IngestResult<FieldDescriptor> {
    let physical_type = match field.r#type {
        FieldType::String => PhysicalType::String,
        FieldType::Bytes => PhysicalType::Bytes,
        FieldType::Integer | FieldType::Int64 => PhysicalType::Int64,
        FieldType::Float | FieldType::Float64 => PhysicalType::Float64,
        FieldType::Boolean | FieldType::Bool => PhysicalType::Bool,
        FieldType::Timestamp => PhysicalType::Timestamp,
        FieldType::Date => PhysicalType::Date,
        FieldType::Time => PhysicalType::Time,
        FieldType::Datetime => PhysicalType::DateTime,
        FieldType::Json => PhysicalType::Json,
        FieldType::Record | FieldType::Struct => PhysicalType::Record,
        ref other => bail!(
            ErrorKind::InvalidData,
            "Unsupported column type",
            format!("column `{}` has type {other:?}", field.name)
        ),
    };

    let mode = match field.mode.as_deref() {
        Some(mode) if mode.eq_ignore_ascii_case("REQUIRED") => FieldMode::Required,
        Some(mode) if mode.eq_ignore_ascii_case("REPEATED") => FieldMode::Repeated,
        _ => FieldMode::Nullable,
    };

    let children = field
        .fields
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(field_descriptor)
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(FieldDescriptor {
        name: field.name.clone(),
        physical_type,
        mode,
        children,
    })
}

/// One page of query results, from the initial response or a later poll.
#[derive(Debug)]
struct QueryPage {
    complete: bool,
    job_id: Option<String>,
    page_token: Option<String>,
    affected_rows: Option<u64>,
    rows: Vec<Map<String, Value>>,
}

impl QueryPage {
    fn new(
        job_complete: Option<bool>,
        job_reference: Option<JobReference>,
        page_token: Option<String>,
        num_dml_affected_rows: Option<String>,
        schema: Option<BigQueryTableSchema>,
        rows: Option<Vec<TableRow>>,
    ) -> Self {
        let complete = job_complete.unwrap_or(true);
        let rows = match (complete, schema, rows) {
            (true, Some(schema), Some(rows)) => {
                decode_rows(schema.fields.as_deref().unwrap_or_default(), &rows)
            }
            _ => Vec::new(),
        };

        Self {
            complete,
            job_id: job_reference.and_then(|reference| reference.job_id),
            page_token,
            // The REST API encodes the count as a decimal string.
            affected_rows: num_dml_affected_rows.and_then(|count| count.parse().ok()),
            rows,
        }
    }
}

impl From<QueryResponse> for QueryPage {
    fn from(response: QueryResponse) -> Self {
        QueryPage::new(
            response.job_complete,
            response.job_reference,
            response.page_token,
            response.num_dml_affected_rows,
            response.schema,
            response.rows,
        )
    }
}

impl From<GetQueryResultsResponse> for QueryPage {
    fn from(response: GetQueryResultsResponse) -> Self {
        QueryPage::new(
            response.job_complete,
            response.job_reference,
            response.page_token,
            response.num_dml_affected_rows,
            response.schema,
            response.rows,
        )
    }
}

/// Converts result rows into objects keyed by column name.
fn decode_rows(fields: &[TableFieldSchema], rows: &[TableRow]) -> Vec<Map<String, Value>> {
    rows.iter()
        .map(|row| {
            let cells = row.columns.as_deref().unwrap_or_default();

            fields
                .iter()
                .zip(cells)
                .map(|(field, cell)| {
                    let value = cell.value.as_ref().unwrap_or(&Value::Null);
                    (field.name.clone(), decode_cell(field, value))
                })
                .collect()
        })
        .collect()
}

/// Decodes a nested record, still in the `{"f": [{"v": ..}]}` wire encoding.
fn decode_record(fields: &[TableFieldSchema], value: &Value) -> Map<String, Value> {
    let cells = value
        .get("f")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            let value = cell.get("v").unwrap_or(&Value::Null);
            (field.name.clone(), decode_cell(field, value))
        })
        .collect()
}

fn decode_cell(field: &TableFieldSchema, value: &Value) -> Value {
    if field.mode.as_deref() == Some("REPEATED") {
        let Some(elements) = value.as_array() else {
            return Value::Null;
        };

        return Value::Array(
            elements
                .iter()
                .map(|element| {
                    decode_scalar_or_record(field, element.get("v").unwrap_or(&Value::Null))
                })
                .collect(),
        );
    }

    decode_scalar_or_record(field, value)
}

fn decode_scalar_or_record(field: &TableFieldSchema, value: &Value) -> Value {
    if matches!(field.r#type, FieldType::Record | FieldType::Struct) && !value.is_null() {
        let children = field.fields.as_deref().unwrap_or_default();
        return Value::Object(decode_record(children, value));
    }

    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcp_bigquery_client::google::cloud::bigquery::storage::v1::RowError as StorageRowError;
    use gcp_bigquery_client::google::rpc::Status;
    use serde_json::json;

    #[test]
    fn query_pages_decode_into_named_rows() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "numDmlAffectedRows": "12",
            "schema": {"fields": [
                {"name": "id", "type": "INTEGER", "mode": "NULLABLE"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "owner", "type": "RECORD", "mode": "NULLABLE", "fields": [
                    {"name": "name", "type": "STRING"}
                ]}
            ]},
            "rows": [
                {"f": [
                    {"v": "1"},
                    {"v": [{"v": "a"}, {"v": "b"}]},
                    {"v": {"f": [{"v": "ana"}]}}
                ]},
                {"f": [{"v": null}, {"v": []}, {"v": null}]}
            ]
        }))
        .unwrap();

        let page = QueryPage::from(response);

        assert!(page.complete);
        assert_eq!(page.affected_rows, Some(12));
        assert_eq!(
            Value::Array(page.rows.into_iter().map(Value::Object).collect()),
            json!([
                {"id": "1", "tags": ["a", "b"], "owner": {"name": "ana"}},
                {"id": null, "tags": [], "owner": null}
            ])
        );
    }

    #[test]
    fn incomplete_pages_keep_the_job_reference_and_no_rows() {
        let response: GetQueryResultsResponse = serde_json::from_value(json!({
            "jobComplete": false,
            "jobReference": {"projectId": "p", "jobId": "job_1"},
            "schema": {"fields": [{"name": "id", "type": "INTEGER"}]},
            "rows": [{"f": [{"v": "1"}]}]
        }))
        .unwrap();

        let page = QueryPage::from(response);

        assert!(!page.complete);
        assert_eq!(page.job_id.as_deref(), Some("job_1"));
        assert_eq!(page.affected_rows, None);
        assert!(page.rows.is_empty());
    }

    #[test]
    fn table_fields_convert_to_descriptors() {
        let mut id = TableFieldSchema::integer("id");
        id.mode = Some("REQUIRED".to_string());
        let mut tags = TableFieldSchema::string("tags");
        tags.mode = Some("REPEATED".to_string());
        let payload = TableFieldSchema::record("payload", vec![TableFieldSchema::bytes("raw")]);

        let fields = [id, tags, payload]
            .iter()
            .map(field_descriptor)
            .collect::<IngestResult<Vec<_>>>()
            .unwrap();

        assert_eq!(
            TableSchema::new(fields),
            TableSchema::new(vec![
                FieldDescriptor::new("id", PhysicalType::Int64).with_mode(FieldMode::Required),
                FieldDescriptor::new("tags", PhysicalType::String).repeated(),
                FieldDescriptor::record(
                    "payload",
                    vec![FieldDescriptor::new("raw", PhysicalType::Bytes)]
                ),
            ])
        );
    }

    #[test]
    fn unsupported_table_field_types_are_invalid_data() {
        let err = field_descriptor(&TableFieldSchema::numeric("amount")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn append_responses_map_row_errors_and_statuses() {
        let rejected = AppendRowsResponse {
            row_errors: vec![StorageRowError {
                index: 2,
                code: 1,
                message: "bad value".to_string(),
            }],
            ..Default::default()
        };
        let err = append_response_error(rejected).unwrap();
        assert_eq!(
            err.row_errors,
            vec![RowError {
                index: 2,
                message: "bad value".to_string(),
            }]
        );

        let failed = AppendRowsResponse {
            response: Some(append_rows_response::Response::Error(Status {
                code: 3,
                message: "invalid".to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let err = append_response_error(failed).unwrap();
        assert!(err.row_errors.is_empty());
        assert!(err.message.contains("invalid"));

        let appended = AppendRowsResponse {
            response: Some(append_rows_response::Response::AppendResult(
                append_rows_response::AppendResult { offset: None },
            )),
            ..Default::default()
        };
        assert!(append_response_error(appended).is_none());
    }
}
