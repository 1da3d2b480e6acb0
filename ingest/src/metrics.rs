//! Metrics emitted by the ingestion write paths.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

static REGISTER: Once = Once::new();

/// Label for the write path that stored rows (`streaming`, `load` or `merge`).
pub const PATH_LABEL: &str = "path";

/// Label for the destination table.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Counter for rows accepted by the warehouse.
pub const INGEST_ROWS_TOTAL: &str = "ingest_rows_total";

/// Counter for streaming failures recovered through a load job.
pub const INGEST_STREAMING_FALLBACKS_TOTAL: &str = "ingest_streaming_fallbacks_total";

/// Counter for staging tables that could not be deleted after an upsert.
pub const INGEST_STAGING_CLEANUP_FAILURES_TOTAL: &str = "ingest_staging_cleanup_failures_total";

/// Histogram for the duration of one streaming append.
pub const INGEST_APPEND_DURATION_SECONDS: &str = "ingest_append_duration_seconds";

/// Histogram for the number of rows in one streaming append.
pub const INGEST_APPEND_BATCH_SIZE: &str = "ingest_append_batch_size";

/// Register ingestion metrics. Safe to call multiple times.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        describe_counter!(
            INGEST_ROWS_TOTAL,
            Unit::Count,
            "Total number of rows written to the warehouse, labeled by write path"
        );
        describe_counter!(
            INGEST_STREAMING_FALLBACKS_TOTAL,
            Unit::Count,
            "Total number of streaming writes that fell back to a load job"
        );
        describe_counter!(
            INGEST_STAGING_CLEANUP_FAILURES_TOTAL,
            Unit::Count,
            "Total number of staging tables left behind after an upsert"
        );
        describe_histogram!(
            INGEST_APPEND_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken in seconds by one streaming append"
        );
        describe_histogram!(
            INGEST_APPEND_BATCH_SIZE,
            Unit::Count,
            "Number of rows sent by one streaming append"
        );
    });
}
