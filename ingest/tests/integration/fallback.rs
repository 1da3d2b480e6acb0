use ingest::error::{ErrorKind, RowError, WriteError};
use ingest::ingestor::{Ingestor, InsertOptions};
use ingest::normalize::normalize_rows;
use ingest::test_utils::{FaultyWarehouse, init_test_tracing};
use ingest::types::WriteDisposition;
use ingest::warehouse::MemoryWarehouse;

use crate::support::{as_json, ticket, tickets_schema};

fn faulty() -> FaultyWarehouse<MemoryWarehouse> {
    FaultyWarehouse::new(MemoryWarehouse::new("p", "d"))
}

#[tokio::test]
async fn streaming_failure_falls_back_to_one_load_job_of_the_same_rows() {
    init_test_tracing();

    let warehouse = faulty();
    warehouse.fail_appends(WriteError::new("connection reset"));
    let ingestor = Ingestor::new(warehouse.clone());
    let rows = vec![ticket(1, "open"), ticket(2, "pending")];

    let result = ingestor
        .insert_rows(
            "tickets",
            &rows,
            &InsertOptions::default().with_schema(tickets_schema()),
        )
        .await
        .unwrap();

    assert!(!result.streamed_ok);
    assert!(result.fallback_used);
    assert_eq!(result.error.as_deref(), Some("connection reset"));

    let calls = warehouse.calls();
    assert_eq!(calls.append_batch, 1);
    assert_eq!(calls.load_rows, 1);
    let (table, loaded, config) = &calls.loads[0];
    assert_eq!(table, "tickets");
    assert_eq!(*loaded, 2);
    assert_eq!(config.write_disposition, WriteDisposition::Append);
    assert!(config.ignore_unknown_values);
    assert!(config.allow_quoted_newlines);

    let schema = tickets_schema();
    let expected: Vec<_> = normalize_rows(&rows, &schema)
        .iter()
        .map(|row| row.to_json(&schema))
        .collect();
    assert_eq!(
        as_json(warehouse.inner().rows("tickets").await),
        as_json(expected)
    );
}

#[tokio::test]
async fn row_level_errors_still_fall_back() {
    init_test_tracing();

    let warehouse = faulty();
    warehouse.fail_appends(WriteError::with_row_errors(
        "append rejected 1 rows",
        vec![RowError {
            index: 1,
            message: "invalid: no such field".to_string(),
        }],
    ));
    let ingestor = Ingestor::new(warehouse.clone());

    let result = ingestor
        .insert_rows(
            "tickets",
            &[ticket(1, "open"), ticket(2, "open")],
            &InsertOptions::default().with_schema(tickets_schema()),
        )
        .await
        .unwrap();

    assert!(result.fallback_used);
    assert_eq!(warehouse.calls().load_rows, 1);
    assert_eq!(warehouse.inner().rows("tickets").await.len(), 2);
}

#[tokio::test]
async fn failing_fallback_propagates_without_further_retries() {
    init_test_tracing();

    let warehouse = faulty();
    warehouse.fail_appends(WriteError::new("connection reset"));
    warehouse.fail_loads("load job failed");
    let ingestor = Ingestor::new(warehouse.clone());

    let err = ingestor
        .insert_rows(
            "tickets",
            &[ticket(1, "open")],
            &InsertOptions::default().with_schema(tickets_schema()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadJobFailure);
    let calls = warehouse.calls();
    assert_eq!(calls.append_batch, 1);
    assert_eq!(calls.load_rows, 1);
    assert!(warehouse.inner().rows("tickets").await.is_empty());
}

#[tokio::test]
async fn successful_streaming_never_loads() {
    init_test_tracing();

    let warehouse = faulty();
    let ingestor = Ingestor::new(warehouse.clone());

    let result = ingestor
        .insert_rows(
            "tickets",
            &[ticket(1, "open")],
            &InsertOptions::default().with_schema(tickets_schema()),
        )
        .await
        .unwrap();

    assert!(result.streamed_ok);
    assert_eq!(warehouse.calls().load_rows, 0);
}
