//! Low-latency appends through the warehouse streaming path.

use std::time::Instant;

use config::shared::IngestConfig;
use metrics::{counter, histogram};
use tracing::debug;

use crate::encoding::encode_batch;
use crate::error::WriteError;
use crate::metrics::{
    INGEST_APPEND_BATCH_SIZE, INGEST_APPEND_DURATION_SECONDS, INGEST_ROWS_TOTAL, PATH_LABEL,
    TABLE_NAME_LABEL, register_metrics,
};
use crate::normalize::normalize_rows;
use crate::types::{NormalizedRow, Row, TableSchema};
use crate::warehouse::Warehouse;

/// Appends rows in fixed-size chunks, one record batch per chunk.
///
/// Chunks are sent sequentially and the first failing chunk aborts the call. Row indexes in the
/// returned [`WriteError`] are relative to the whole call, not to the failing chunk.
#[derive(Debug, Clone)]
pub struct StreamingWriter<W> {
    warehouse: W,
    chunk_size: usize,
}

impl<W: Warehouse> StreamingWriter<W> {
    pub fn new(warehouse: W) -> Self {
        Self {
            warehouse,
            chunk_size: IngestConfig::DEFAULT_STREAMING_CHUNK_SIZE,
        }
    }

    pub fn from_config(warehouse: W, config: &IngestConfig) -> Self {
        Self::new(warehouse).with_chunk_size(config.streaming_chunk_size)
    }

    /// Sets the number of rows per appended batch. Zero is treated as one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Normalizes `rows` against `schema` and appends them.
    pub async fn append(&self, table: &str, rows: &[Row], schema: &TableSchema) -> Result<(), WriteError> {
        let rows = normalize_rows(rows, schema);

        self.append_normalized(table, &rows, schema).await
    }

    /// Appends rows that were already normalized against `schema`.
    pub async fn append_normalized(
        &self,
        table: &str,
        rows: &[NormalizedRow],
        schema: &TableSchema,
    ) -> Result<(), WriteError> {
        register_metrics();

        for (chunk_index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let offset = chunk_index * self.chunk_size;

            let batch = encode_batch(chunk, schema).map_err(|err| err.offset_rows(offset))?;

            let started = Instant::now();
            self.warehouse
                .append_batch(table, &batch)
                .await
                .map_err(|err| err.offset_rows(offset))?;

            histogram!(INGEST_APPEND_DURATION_SECONDS, TABLE_NAME_LABEL => table.to_string())
                .record(started.elapsed().as_secs_f64());
            histogram!(INGEST_APPEND_BATCH_SIZE, TABLE_NAME_LABEL => table.to_string())
                .record(chunk.len() as f64);

            debug!(%table, chunk = chunk_index, rows = chunk.len(), "appended chunk");
        }

        counter!(
            INGEST_ROWS_TOTAL,
            PATH_LABEL => "streaming",
            TABLE_NAME_LABEL => table.to_string()
        )
        .increment(rows.len() as u64);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RowError;
    use crate::test_utils::FaultyWarehouse;
    use crate::types::{FieldDescriptor, PhysicalType, TableSpec};
    use crate::warehouse::MemoryWarehouse;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldDescriptor::new("id", PhysicalType::Int64).required(),
            FieldDescriptor::new("name", PhysicalType::String),
        ])
    }

    fn rows(count: i64) -> Vec<Row> {
        (0..count)
            .map(|id| Row::new().with("id", id).with("name", format!("row {id}")))
            .collect()
    }

    async fn warehouse() -> FaultyWarehouse<MemoryWarehouse> {
        let warehouse = MemoryWarehouse::new("p", "d");
        warehouse
            .create_table("t", &TableSpec::new(schema()))
            .await
            .unwrap();

        FaultyWarehouse::new(warehouse)
    }

    #[tokio::test]
    async fn rows_are_sent_in_bounded_chunks() {
        let warehouse = warehouse().await;
        let writer = StreamingWriter::new(warehouse.clone()).with_chunk_size(2);

        writer.append("t", &rows(5), &schema()).await.unwrap();

        assert_eq!(warehouse.calls().appended_batch_sizes, vec![2, 2, 1]);
        assert_eq!(warehouse.inner().rows("t").await.len(), 5);
    }

    #[tokio::test]
    async fn default_chunk_size_is_five_hundred() {
        let warehouse = warehouse().await;
        let writer = StreamingWriter::new(warehouse.clone());

        writer.append("t", &rows(1001), &schema()).await.unwrap();

        assert_eq!(warehouse.calls().appended_batch_sizes, vec![500, 500, 1]);
    }

    #[tokio::test]
    async fn failing_chunk_aborts_and_reports_call_relative_rows() {
        let warehouse = warehouse().await;
        warehouse.fail_append_at(
            1,
            WriteError::with_row_errors(
                "rejected",
                vec![RowError {
                    index: 0,
                    message: "bad value".to_string(),
                }],
            ),
        );
        let writer = StreamingWriter::new(warehouse.clone()).with_chunk_size(2);

        let err = writer.append("t", &rows(6), &schema()).await.unwrap_err();

        assert_eq!(err.row_errors[0].index, 2);
        assert_eq!(warehouse.calls().append_batch, 2);
        assert_eq!(warehouse.inner().rows("t").await.len(), 2);
    }

    #[tokio::test]
    async fn encoding_errors_are_reported_before_sending() {
        let warehouse = warehouse().await;
        let writer = StreamingWriter::new(warehouse.clone()).with_chunk_size(2);
        let mut rows = rows(4);
        rows[3] = Row::new().with("name", "no id");

        let err = writer.append("t", &rows, &schema()).await.unwrap_err();

        assert_eq!(err.row_errors.len(), 1);
        assert_eq!(err.row_errors[0].index, 3);
        assert_eq!(warehouse.calls().append_batch, 1);
    }
}
