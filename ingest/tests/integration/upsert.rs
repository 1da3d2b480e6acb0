use ingest::error::ErrorKind;
use ingest::ingestor::{Ingestor, InsertOptions};
use ingest::merge::MergeUpserter;
use ingest::test_utils::{FaultyWarehouse, init_test_tracing};
use ingest::types::Row;
use ingest::warehouse::{MemoryWarehouse, Warehouse};
use serde_json::json;

use crate::support::{as_json, ticket, tickets_schema};

fn keys() -> Vec<String> {
    vec!["id".to_string()]
}

async fn staging_tables(warehouse: &MemoryWarehouse) -> Vec<String> {
    warehouse
        .list_tables()
        .await
        .unwrap()
        .into_iter()
        .filter(|name| name.contains("__stg_"))
        .collect()
}

#[tokio::test]
async fn repeating_an_upsert_leaves_the_table_unchanged() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let upserter = MergeUpserter::new(warehouse.clone());
    let rows = vec![ticket(1, "open"), ticket(2, "pending")];

    let first = upserter
        .upsert("tickets", &rows, &tickets_schema(), &keys(), None)
        .await
        .unwrap();
    let after_first = as_json(warehouse.rows("tickets").await);
    let second = upserter
        .upsert("tickets", &rows, &tickets_schema(), &keys(), None)
        .await
        .unwrap();

    assert_eq!(first.total_rows, 2);
    assert_eq!(first.affected_rows, 2);
    assert_eq!(second.total_rows, 2);
    assert_eq!(second.affected_rows, 2);
    assert_eq!(as_json(warehouse.rows("tickets").await), after_first);
}

#[tokio::test]
async fn changed_rows_converge_to_the_latest_values() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let upserter = MergeUpserter::new(warehouse.clone());

    upserter
        .upsert("tickets", &[ticket(1, "open")], &tickets_schema(), &keys(), None)
        .await
        .unwrap();
    upserter
        .upsert(
            "tickets",
            &[ticket(1, "closed"), ticket(2, "open")],
            &tickets_schema(),
            &keys(),
            None,
        )
        .await
        .unwrap();

    let mut stored = warehouse.rows("tickets").await;
    stored.sort_by_key(|row| row["id"].as_i64());
    assert_eq!(
        as_json(stored),
        json!([
            {"id": 1, "status": "closed", "tags": ["billing", "vip"]},
            {"id": 2, "status": "open", "tags": ["billing", "vip"]}
        ])
    );
}

#[tokio::test]
async fn explicit_update_columns_leave_other_columns_alone() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let upserter = MergeUpserter::new(warehouse.clone());
    upserter
        .upsert("tickets", &[ticket(1, "open")], &tickets_schema(), &keys(), None)
        .await
        .unwrap();

    let changed = Row::new()
        .with("id", 1)
        .with("status", "closed")
        .with("tags", "[]");
    upserter
        .upsert(
            "tickets",
            &[changed],
            &tickets_schema(),
            &keys(),
            Some(&["status".to_string()]),
        )
        .await
        .unwrap();

    assert_eq!(
        as_json(warehouse.rows("tickets").await),
        json!([{"id": 1, "status": "closed", "tags": ["billing", "vip"]}])
    );
}

#[tokio::test]
async fn staging_tables_are_removed_after_success() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let upserter = MergeUpserter::new(warehouse.clone());

    upserter
        .upsert("tickets", &[ticket(1, "open")], &tickets_schema(), &keys(), None)
        .await
        .unwrap();

    assert!(staging_tables(&warehouse).await.is_empty());
    assert_eq!(warehouse.list_tables().await.unwrap(), vec!["tickets".to_string()]);
}

#[tokio::test]
async fn staging_tables_are_removed_after_a_failed_merge() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let faulty = FaultyWarehouse::new(warehouse.clone());
    faulty.fail_merges("merge rejected");
    let upserter = MergeUpserter::new(faulty.clone());

    let err = upserter
        .upsert("tickets", &[ticket(1, "open")], &tickets_schema(), &keys(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MergeFailure);
    assert_eq!(faulty.calls().delete_table, 1);
    assert!(staging_tables(&warehouse).await.is_empty());
    assert!(warehouse.rows("tickets").await.is_empty());
}

#[tokio::test]
async fn staging_tables_are_removed_after_a_failed_staging_load() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let faulty = FaultyWarehouse::new(warehouse.clone());
    faulty.fail_loads("staging load rejected");
    let upserter = MergeUpserter::new(faulty.clone());

    let err = upserter
        .upsert("tickets", &[ticket(1, "open")], &tickets_schema(), &keys(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadJobFailure);
    assert_eq!(faulty.calls().merge, 0);
    assert!(staging_tables(&warehouse).await.is_empty());
}

#[tokio::test]
async fn healed_warehouse_accepts_the_retried_upsert() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let faulty = FaultyWarehouse::new(warehouse.clone());
    faulty.fail_merges("merge rejected");
    let upserter = MergeUpserter::new(faulty.clone());
    let rows = vec![ticket(1, "open")];

    upserter
        .upsert("tickets", &rows, &tickets_schema(), &keys(), None)
        .await
        .unwrap_err();
    faulty.heal();
    let result = upserter
        .upsert("tickets", &rows, &tickets_schema(), &keys(), None)
        .await
        .unwrap();

    assert_eq!(result.affected_rows, 1);
    assert_eq!(warehouse.rows("tickets").await.len(), 1);
    assert!(staging_tables(&warehouse).await.is_empty());
}

#[tokio::test]
async fn concurrent_upserts_use_distinct_staging_tables() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let upserter = MergeUpserter::new(warehouse.clone());
    let schema = tickets_schema();
    let keys = keys();

    let first_rows = [ticket(1, "open")];
    let second_rows = [ticket(2, "open")];
    let (first, second) = tokio::join!(
        upserter.upsert("tickets", &first_rows, &schema, &keys, None),
        upserter.upsert("tickets", &second_rows, &schema, &keys, None),
    );

    first.unwrap();
    second.unwrap();
    assert_eq!(warehouse.rows("tickets").await.len(), 2);
    assert!(staging_tables(&warehouse).await.is_empty());
}

#[tokio::test]
async fn insert_rows_with_keys_upserts() {
    init_test_tracing();

    let warehouse = MemoryWarehouse::new("p", "d");
    let ingestor = Ingestor::new(warehouse.clone());
    let options = InsertOptions::default()
        .with_schema(tickets_schema())
        .with_key_columns(keys());

    ingestor
        .insert_rows("tickets", &[ticket(1, "open")], &options)
        .await
        .unwrap();
    let result = ingestor
        .insert_rows("tickets", &[ticket(1, "closed")], &options)
        .await
        .unwrap();

    let upsert = result.upsert.unwrap();
    assert_eq!(upsert.total_rows, 1);
    assert_eq!(upsert.affected_rows, 1);
    assert!(!result.fallback_used);
    assert_eq!(warehouse.rows("tickets").await[0]["status"], "closed");
}
