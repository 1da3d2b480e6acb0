use ingest::error::ErrorKind;
use ingest::ingestor::{Ingestor, InsertOptions};
use ingest::test_utils::{FaultyWarehouse, WarehouseCalls, init_test_tracing};
use ingest::types::{FieldDescriptor, PhysicalType, Row, TableSchema};
use ingest::warehouse::{MemoryWarehouse, Warehouse};
use serde_json::json;

use crate::support::{as_json, ticket, tickets_schema};

#[tokio::test]
async fn empty_batch_succeeds_without_touching_the_warehouse() {
    init_test_tracing();

    let warehouse = FaultyWarehouse::new(MemoryWarehouse::without_dataset("p", "d"));
    let ingestor = Ingestor::new(warehouse.clone());

    let result = ingestor
        .insert_rows("tickets", &[], &InsertOptions::default())
        .await
        .unwrap();

    assert!(result.streamed_ok);
    assert!(!result.fallback_used);
    assert_eq!(result.error, None);
    assert_eq!(warehouse.calls(), WarehouseCalls::default());
    assert!(warehouse.inner().executed_queries().await.is_empty());
}

#[tokio::test]
async fn missing_table_without_schema_is_schema_required() {
    init_test_tracing();

    let ingestor = Ingestor::new(MemoryWarehouse::new("p", "d"));

    let err = ingestor
        .insert_rows("tickets", &[ticket(1, "open")], &InsertOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaRequired);
}

#[tokio::test]
async fn missing_dataset_is_created_before_the_table() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::without_dataset("p", "d");
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
    assert!(warehouse.dataset_exists().await.unwrap());
    assert_eq!(warehouse.rows("tickets").await.len(), 1);
}

#[tokio::test]
async fn loosely_typed_rows_are_normalized_before_streaming() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let ingestor = Ingestor::new(warehouse.clone());
    let schema = TableSchema::new(vec![
        FieldDescriptor::new("name", PhysicalType::String),
        FieldDescriptor::new("tag_bytes", PhysicalType::Bytes),
        FieldDescriptor::new("meta", PhysicalType::Json),
        FieldDescriptor::record(
            "comments",
            vec![FieldDescriptor::new("body", PhysicalType::String)],
        )
        .repeated(),
    ]);
    let row = Row::from(
        json!({
            "name": 123,
            "tag_bytes": "x",
            "meta": {"a": 1},
            "comments": "{\"body\": \"hi\"}"
        })
        .as_object()
        .unwrap()
        .clone(),
    );

    let result = ingestor
        .insert_rows("messages", &[row], &InsertOptions::default().with_schema(schema))
        .await
        .unwrap();

    assert!(result.streamed_ok);
    assert_eq!(
        as_json(warehouse.rows("messages").await),
        json!([{
            "name": "123",
            "tag_bytes": "eA==",
            "meta": "{\"a\": 1}",
            "comments": [{"body": "hi"}]
        }])
    );
}

#[tokio::test]
async fn encoded_repeated_strings_are_recovered() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let ingestor = Ingestor::new(warehouse.clone());
    let options = InsertOptions::default().with_schema(tickets_schema());

    ingestor
        .insert_rows("tickets", &[ticket(1, "open")], &options)
        .await
        .unwrap();

    assert_eq!(
        as_json(warehouse.rows("tickets").await),
        json!([{"id": 1, "status": "open", "tags": ["billing", "vip"]}])
    );
}

#[tokio::test]
async fn existing_table_schema_wins_over_the_supplied_one() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let ingestor = Ingestor::new(warehouse.clone());
    ingestor
        .insert_rows(
            "tickets",
            &[ticket(1, "open")],
            &InsertOptions::default().with_schema(tickets_schema()),
        )
        .await
        .unwrap();

    let narrower = TableSchema::new(vec![FieldDescriptor::new("id", PhysicalType::String)]);
    ingestor
        .insert_rows(
            "tickets",
            &[ticket(2, "closed")],
            &InsertOptions::default().with_schema(narrower),
        )
        .await
        .unwrap();

    assert_eq!(
        warehouse.table_schema("tickets").await.unwrap(),
        Some(tickets_schema())
    );
    assert_eq!(warehouse.rows("tickets").await.len(), 2);
}
