//! Restore issues store calls in dependency order.
//!
//! A thin `RecordStore` wrapper logs every transactional call so the tests
//! can assert on the exact sequence the executor produced.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use strongbox_core::{BackupService, DependencySequencer, EngineConfig, EntityRegistry, Snapshot};
use strongbox_state::fakes::{MemoryRecordStore, MemorySnapshotStore};
use strongbox_state::{
    Connect, Record, RecordStore, StorageResult, StoreSchema, StoreTx, TxOptions,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Delete(String),
    CreateMany(String),
    Create(String, Vec<String>),
    Update(String, String),
}

type CallLog = Arc<Mutex<Vec<Call>>>;

struct RecordingStore {
    inner: MemoryRecordStore,
    log: CallLog,
}

struct RecordingTx {
    inner: Box<dyn StoreTx>,
    log: CallLog,
}

#[async_trait]
impl RecordStore for RecordingStore {
    fn schema(&self) -> &StoreSchema {
        self.inner.schema()
    }

    async fn find_many(&self, table: &str) -> StorageResult<Vec<Record>> {
        self.inner.find_many(table).await
    }

    async fn begin(&self, options: TxOptions) -> StorageResult<Box<dyn StoreTx>> {
        Ok(Box::new(RecordingTx {
            inner: self.inner.begin(options).await?,
            log: self.log.clone(),
        }))
    }
}

#[async_trait]
impl StoreTx for RecordingTx {
    async fn create_many(&mut self, table: &str, records: Vec<Record>) -> StorageResult<u64> {
        self.log.lock().unwrap().push(Call::CreateMany(table.to_string()));
        self.inner.create_many(table, records).await
    }

    async fn create(&mut self, table: &str, record: Record, connect: Vec<Connect>) -> StorageResult<()> {
        let relations = connect.iter().map(|c| c.relation.clone()).collect();
        self.log
            .lock()
            .unwrap()
            .push(Call::Create(table.to_string(), relations));
        self.inner.create(table, record, connect).await
    }

    async fn update(&mut self, table: &str, key: &str, patch: Record) -> StorageResult<()> {
        self.log
            .lock()
            .unwrap()
            .push(Call::Update(table.to_string(), key.to_string()));
        self.inner.update(table, key, patch).await
    }

    async fn delete_many(&mut self, table: &str) -> StorageResult<u64> {
        self.log.lock().unwrap().push(Call::Delete(table.to_string()));
        self.inner.delete_many(table).await
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.inner.rollback().await
    }
}

fn dataset() -> Snapshot {
    Snapshot::from_value(json!({
        "version": "1.0",
        "timestamp": "2024-05-01T12:00:00Z",
        "users": [{"id": "u1"}],
        "accounts": [{"id": "a1", "ownerId": "u1"}],
        "opportunities": [{"id": "o1", "accountId": "a1", "ownerId": "u1", "featureIds": ["f1"]}],
        "products": [{"id": "pr1", "ownerId": "u1"}],
        "releases": [{"id": "rel1", "productId": "pr1"}],
        "features": [
            {"id": "f1", "productId": "pr1", "parentId": null, "releaseIds": ["rel1"]},
            {"id": "f2", "productId": "pr1", "parentId": "f1", "releaseIds": ["rel1"]}
        ]
    }))
    .unwrap()
}

async fn recorded_restore() -> (Vec<Call>, DependencySequencer) {
    let registry = EntityRegistry::business().unwrap();
    let sequencer = DependencySequencer::new(&registry).unwrap();
    let log = CallLog::default();
    let store = Arc::new(RecordingStore {
        inner: MemoryRecordStore::new(registry.store_schema()),
        log: log.clone(),
    });
    let service = BackupService::new(
        registry,
        store,
        Arc::new(MemorySnapshotStore::new()),
        EngineConfig::default(),
    )
    .unwrap();
    service.restore(&dataset()).await.unwrap();
    let calls = log.lock().unwrap().clone();
    (calls, sequencer)
}

#[tokio::test]
async fn deletes_run_in_reverse_insert_order_before_any_insert() {
    let (calls, sequencer) = recorded_restore().await;

    let deletes: Vec<&str> = calls
        .iter()
        .take_while(|c| matches!(c, Call::Delete(_)))
        .map(|c| match c {
            Call::Delete(t) => t.as_str(),
            _ => unreachable!(),
        })
        .collect();
    let expected: Vec<&str> = sequencer.delete_order().collect();
    assert_eq!(deletes, expected);
    assert!(calls[deletes.len()..]
        .iter()
        .all(|c| !matches!(c, Call::Delete(_))));
}

#[tokio::test]
async fn inserts_follow_dependency_order() {
    let (calls, sequencer) = recorded_restore().await;

    let mut last = 0;
    for call in &calls {
        let table = match call {
            Call::CreateMany(t) | Call::Create(t, _) if !t.starts_with('_') => t,
            _ => continue,
        };
        let pos = sequencer.position(table).unwrap();
        assert!(pos >= last, "{table} inserted out of order");
        last = pos;
    }
}

#[tokio::test]
async fn peer_already_present_connects_on_create() {
    let (calls, _) = recorded_restore().await;

    // Release precedes Feature, so features are created one by one with the
    // release link attached.
    let feature_creates: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::Create(t, _) if t == "Feature"))
        .collect();
    assert_eq!(feature_creates.len(), 2);
    assert!(feature_creates
        .iter()
        .all(|c| matches!(c, Call::Create(_, rel) if rel == &vec!["_FeatureToRelease".to_string()])));
}

#[tokio::test]
async fn later_peer_is_bulk_inserted_and_connected_last() {
    let (calls, _) = recorded_restore().await;

    assert!(calls.contains(&Call::CreateMany("Opportunity".to_string())));
    assert!(!calls.iter().any(|c| matches!(c, Call::Create(t, _) if t == "Opportunity")));
    assert_eq!(
        calls.last(),
        Some(&Call::CreateMany("_FeatureToOpportunity".to_string()))
    );
}

#[tokio::test]
async fn self_references_are_patched_after_their_type_is_inserted() {
    let (calls, _) = recorded_restore().await;

    let patch = calls
        .iter()
        .position(|c| c == &Call::Update("Feature".to_string(), "f2".to_string()))
        .expect("f2 parent patched");
    let last_feature_create = calls
        .iter()
        .rposition(|c| matches!(c, Call::Create(t, _) if t == "Feature"))
        .unwrap();
    assert!(patch > last_feature_create);
    assert!(!calls
        .iter()
        .any(|c| matches!(c, Call::Update(_, key) if key == "f1")));
}
