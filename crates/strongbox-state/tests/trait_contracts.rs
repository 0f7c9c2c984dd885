//! Trait contract tests for RecordStore and SnapshotStore.
//!
//! These tests verify the behavioral contracts of the storage traits
//! using in-memory fakes and the SurrealDB `mem://` engine. Any conforming
//! implementation must pass these.

use std::time::Duration;

use serde_json::json;
use strongbox_state::fakes::{Fault, MemoryRecordStore, MemorySnapshotStore};
use strongbox_state::storage_traits::*;
use strongbox_state::{StorageError, SurrealRecordStore, SurrealSnapshotStore};

fn schema() -> StoreSchema {
    StoreSchema::new(vec![
        TableSchema::new("User"),
        TableSchema::new("Task")
            .with_foreign_key("assigneeId", "User")
            .with_foreign_key("parentId", "Task"),
        TableSchema::new("Tag"),
        TableSchema::join("_TagToTask", "Task", "Tag"),
    ])
}

fn rec(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn seed_user(store: &dyn RecordStore, id: &str) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many("User", vec![rec(json!({"id": id, "name": "Alice"}))])
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

// ===========================================================================
// RecordStore contract tests (run against both backends)
// ===========================================================================

async fn contract_commit_makes_rows_visible(store: &dyn RecordStore) {
    seed_user(store, "u1").await;
    let users = store.find_many("User").await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["name"], "Alice");
}

async fn contract_dropped_tx_rolls_back(store: &dyn RecordStore) {
    {
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.create_many("User", vec![rec(json!({"id": "u9"}))])
            .await
            .unwrap();
    }
    assert!(store.find_many("User").await.unwrap().is_empty());
}

async fn contract_dangling_foreign_key_rejected(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    let err = tx
        .create_many("Task", vec![rec(json!({"id": "t1", "assigneeId": "ghost"}))])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKey { ref column, .. } if column == "assigneeId"));
}

async fn contract_duplicate_key_rejected(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many("User", vec![rec(json!({"id": "dup"}))])
        .await
        .unwrap();
    let err = tx
        .create_many("User", vec![rec(json!({"id": "dup"}))])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
}

async fn contract_create_connects_join_rows(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many("Tag", vec![rec(json!({"id": "g1"})), rec(json!({"id": "g2"}))])
        .await
        .unwrap();
    tx.create(
        "Task",
        rec(json!({"id": "t1", "parentId": null})),
        vec![Connect {
            relation: "_TagToTask".to_string(),
            peer_ids: vec!["g1".to_string(), "g2".to_string()],
        }],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let links = store.find_many("_TagToTask").await.unwrap();
    assert_eq!(links.len(), 2);
    assert!(links.iter().all(|l| l["A"] == "t1"));
}

async fn contract_update_patches_self_reference(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many(
        "Task",
        vec![
            rec(json!({"id": "t1", "parentId": null, "title": "root"})),
            rec(json!({"id": "t2", "parentId": null, "title": "child"})),
        ],
    )
    .await
    .unwrap();
    tx.update("Task", "t2", rec(json!({"parentId": "t1"})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let tasks = store.find_many("Task").await.unwrap();
    let t2 = tasks.iter().find(|t| t["id"] == "t2").unwrap();
    assert_eq!(t2["parentId"], "t1");
    assert_eq!(t2["title"], "child");
}

async fn contract_update_missing_row_fails(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    let err = tx
        .update("Task", "nope", rec(json!({"title": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RecordNotFound { .. }));
}

async fn contract_unknown_table_rejected(store: &dyn RecordStore) {
    let err = store.find_many("Invoice").await.unwrap_err();
    assert!(matches!(err, StorageError::UnknownTable { .. }));
}

async fn contract_delete_many_counts_rows(store: &dyn RecordStore) {
    seed_user(store, "a").await;
    seed_user(store, "b").await;
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    assert_eq!(tx.delete_many("User").await.unwrap(), 2);
    tx.commit().await.unwrap();
    assert!(store.find_many("User").await.unwrap().is_empty());
}

async fn contract_delete_restricted_while_referenced(store: &dyn RecordStore) {
    seed_user(store, "u1").await;
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many("Task", vec![rec(json!({"id": "t1", "assigneeId": "u1"}))])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    let err = tx.delete_many("User").await.unwrap_err();
    assert!(matches!(err, StorageError::ForeignKey { ref table, .. } if table == "Task"));

    // Dependents first, then the dependency.
    tx.delete_many("Task").await.unwrap();
    tx.delete_many("User").await.unwrap();
    tx.commit().await.unwrap();
    assert!(store.find_many("User").await.unwrap().is_empty());
}

async fn contract_null_fields_survive_round_trip(store: &dyn RecordStore) {
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many(
        "Task",
        vec![
            rec(json!({"id": "t1", "assigneeId": null, "parentId": null})),
            rec(json!({"id": "t2", "assigneeId": null, "parentId": null})),
        ],
    )
    .await
    .unwrap();
    tx.update("Task", "t2", rec(json!({"parentId": "t1"})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let tasks = store.find_many("Task").await.unwrap();
    assert_eq!(
        tasks,
        vec![
            rec(json!({"id": "t1", "assigneeId": null, "parentId": null})),
            rec(json!({"id": "t2", "assigneeId": null, "parentId": "t1"})),
        ]
    );
}

macro_rules! record_store_contracts {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn commit_makes_rows_visible() {
                let store = $make;
                contract_commit_makes_rows_visible(&store).await;
            }

            #[tokio::test]
            async fn dropped_tx_rolls_back() {
                let store = $make;
                contract_dropped_tx_rolls_back(&store).await;
            }

            #[tokio::test]
            async fn dangling_foreign_key_rejected() {
                let store = $make;
                contract_dangling_foreign_key_rejected(&store).await;
            }

            #[tokio::test]
            async fn duplicate_key_rejected() {
                let store = $make;
                contract_duplicate_key_rejected(&store).await;
            }

            #[tokio::test]
            async fn create_connects_join_rows() {
                let store = $make;
                contract_create_connects_join_rows(&store).await;
            }

            #[tokio::test]
            async fn update_patches_self_reference() {
                let store = $make;
                contract_update_patches_self_reference(&store).await;
            }

            #[tokio::test]
            async fn update_missing_row_fails() {
                let store = $make;
                contract_update_missing_row_fails(&store).await;
            }

            #[tokio::test]
            async fn unknown_table_rejected() {
                let store = $make;
                contract_unknown_table_rejected(&store).await;
            }

            #[tokio::test]
            async fn delete_many_counts_rows() {
                let store = $make;
                contract_delete_many_counts_rows(&store).await;
            }

            #[tokio::test]
            async fn delete_restricted_while_referenced() {
                let store = $make;
                contract_delete_restricted_while_referenced(&store).await;
            }

            #[tokio::test]
            async fn null_fields_survive_round_trip() {
                let store = $make;
                contract_null_fields_survive_round_trip(&store).await;
            }
        }
    };
}

record_store_contracts!(memory, MemoryRecordStore::new(schema()));
record_store_contracts!(
    surreal,
    SurrealRecordStore::in_memory(schema()).await.unwrap()
);

// ===========================================================================
// MemoryRecordStore specifics
// ===========================================================================

#[tokio::test]
async fn memory_injected_failure_leaves_store_unchanged() {
    let store = MemoryRecordStore::new(schema());
    seed_user(&store, "u1").await;
    let before = store.dump();

    store.inject(Fault::FailOnCreate {
        table: "User".to_string(),
    });
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.delete_many("User").await.unwrap();
    let err = tx
        .create_many("User", vec![rec(json!({"id": "u2"}))])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
    tx.rollback().await.unwrap();

    assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn memory_second_writer_times_out_while_first_is_open() {
    let store = MemoryRecordStore::new(schema());
    let _first = store.begin(TxOptions::default()).await.unwrap();

    let options = TxOptions {
        max_wait: Duration::from_millis(20),
        timeout: Duration::from_secs(1),
    };
    let err = match store.begin(options).await {
        Ok(_) => panic!("second writer should not acquire the store"),
        Err(e) => e,
    };
    assert!(matches!(err, StorageError::Busy { waited_ms: 20 }));
}

#[tokio::test]
async fn memory_readers_do_not_see_uncommitted_writes() {
    let store = MemoryRecordStore::new(schema());
    let mut tx = store.begin(TxOptions::default()).await.unwrap();
    tx.create_many("User", vec![rec(json!({"id": "u1"}))])
        .await
        .unwrap();
    assert!(store.find_many("User").await.unwrap().is_empty());
    tx.commit().await.unwrap();
    assert_eq!(store.find_many("User").await.unwrap().len(), 1);
}

// ===========================================================================
// SnapshotStore contract tests
// ===========================================================================

async fn snapshot_contract_save_get(store: &dyn SnapshotStore) {
    let payload = json!({"version": "1.0", "users": [{"id": "u1"}]});
    let saved = store.save(&payload).await.unwrap();
    assert!(saved.meta.filename.starts_with("backup-"));
    assert_eq!(
        saved.meta.size_bytes,
        serde_json::to_string(&payload).unwrap().len() as u64
    );

    let loaded = store.get(&saved.meta.id).await.unwrap();
    assert_eq!(loaded.payload, payload);
    assert_eq!(loaded.meta.digest, saved.meta.digest);
}

async fn snapshot_contract_list_newest_first(store: &dyn SnapshotStore) {
    let first = store.save(&json!({"n": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.save(&json!({"n": 2})).await.unwrap();

    let listed = store.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.meta.id);
    assert_eq!(listed[1].id, first.meta.id);

    assert_eq!(store.list(1).await.unwrap().len(), 1);
}

async fn snapshot_contract_delete(store: &dyn SnapshotStore) {
    let saved = store.save(&json!({"n": 1})).await.unwrap();
    store.delete(&saved.meta.id).await.unwrap();
    let err = store.get(&saved.meta.id).await.unwrap_err();
    assert!(matches!(err, StorageError::SnapshotNotFound { .. }));
    let err = store.delete(&saved.meta.id).await.unwrap_err();
    assert!(matches!(err, StorageError::SnapshotNotFound { .. }));
}

async fn snapshot_contract_prune_keeps_newest(store: &dyn SnapshotStore) {
    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(store.save(&json!({ "n": n })).await.unwrap().meta.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.prune(2).await.unwrap(), 2);

    let remaining: Vec<SnapshotId> = store.list(10).await.unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);
    assert_eq!(store.prune(5).await.unwrap(), 0);
}

#[tokio::test]
async fn memory_snapshot_save_get() {
    snapshot_contract_save_get(&MemorySnapshotStore::new()).await;
}

#[tokio::test]
async fn memory_snapshot_list_newest_first() {
    snapshot_contract_list_newest_first(&MemorySnapshotStore::new()).await;
}

#[tokio::test]
async fn memory_snapshot_delete() {
    snapshot_contract_delete(&MemorySnapshotStore::new()).await;
}

#[tokio::test]
async fn memory_snapshot_prune_keeps_newest() {
    snapshot_contract_prune_keeps_newest(&MemorySnapshotStore::new()).await;
}

#[tokio::test]
async fn memory_snapshot_corruption_detected() {
    let store = MemorySnapshotStore::new();
    let saved = store.save(&json!({"version": "1.0"})).await.unwrap();
    store.overwrite_payload(&saved.meta.id, "{\"version\":\"6.6\"}");
    let err = store.get(&saved.meta.id).await.unwrap_err();
    assert!(matches!(err, StorageError::CorruptSnapshot { .. }));
}

#[tokio::test]
async fn surreal_snapshot_save_get() {
    let store = SurrealSnapshotStore::in_memory().await.unwrap();
    snapshot_contract_save_get(&store).await;
}

#[tokio::test]
async fn surreal_snapshot_list_newest_first() {
    let store = SurrealSnapshotStore::in_memory().await.unwrap();
    snapshot_contract_list_newest_first(&store).await;
}

#[tokio::test]
async fn surreal_snapshot_delete() {
    let store = SurrealSnapshotStore::in_memory().await.unwrap();
    snapshot_contract_delete(&store).await;
}

#[tokio::test]
async fn surreal_snapshot_prune_keeps_newest() {
    let store = SurrealSnapshotStore::in_memory().await.unwrap();
    snapshot_contract_prune_keeps_newest(&store).await;
}
