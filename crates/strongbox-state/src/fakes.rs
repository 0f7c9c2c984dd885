//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRecordStore` and `MemorySnapshotStore` that satisfy the
//! trait contracts without any external dependencies. The record store
//! enforces the schema's foreign keys like a relational database would, and
//! supports fault injection so callers can exercise rollback paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::error::StorageError;
use crate::storage_traits::*;

type Tables = HashMap<String, BTreeMap<String, Record>>;

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Backend("lock poisoned".to_string())
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// Injected failure for a [`MemoryRecordStore`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// `create_many` / `create` on `table` fails with a backend error.
    FailOnCreate { table: String },
    /// `create_many` / `create` on `table` sleeps before doing any work.
    DelayOnCreate { table: String, delay: Duration },
}

/// In-memory record store backed by `HashMap<table, BTreeMap<key, row>>`.
///
/// Write transactions take an exclusive lock for their whole lifetime and
/// operate on a private copy that replaces the committed tables on commit.
#[derive(Debug)]
pub struct MemoryRecordStore {
    schema: Arc<StoreSchema>,
    committed: Arc<RwLock<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryRecordStore {
    pub fn new(schema: StoreSchema) -> Self {
        let tables = schema
            .tables()
            .iter()
            .map(|t| (t.name.clone(), BTreeMap::new()))
            .collect();
        Self {
            schema: Arc::new(schema),
            committed: Arc::new(RwLock::new(tables)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Arm a fault for every transaction opened after this call.
    pub fn inject(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }

    /// Disarm all faults.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Committed contents of every table, keyed by table name.
    pub fn dump(&self) -> BTreeMap<String, Vec<Record>> {
        let tables = match self.committed.read() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.values().cloned().collect()))
            .collect()
    }

    /// Number of committed rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.committed
            .read()
            .map(|t| t.get(table).map(|rows| rows.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    async fn find_many(&self, table: &str) -> StorageResult<Vec<Record>> {
        self.schema.table(table)?;
        let tables = self.committed.read().map_err(poisoned)?;
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn begin(&self, options: TxOptions) -> StorageResult<Box<dyn StoreTx>> {
        let guard = tokio::time::timeout(options.max_wait, self.writer.clone().lock_owned())
            .await
            .map_err(|_| StorageError::Busy {
                waited_ms: options.max_wait.as_millis() as u64,
            })?;

        let working = self.committed.read().map_err(poisoned)?.clone();
        let faults = self.faults.lock().map_err(poisoned)?.clone();

        Ok(Box::new(MemoryTx {
            schema: self.schema.clone(),
            committed: self.committed.clone(),
            working,
            faults,
            _guard: guard,
        }))
    }
}

struct MemoryTx {
    schema: Arc<StoreSchema>,
    committed: Arc<RwLock<Tables>>,
    working: Tables,
    faults: Vec<Fault>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTx {
    async fn apply_faults(&self, table: &str) -> StorageResult<()> {
        for fault in &self.faults {
            match fault {
                Fault::DelayOnCreate { table: t, delay } if t == table => {
                    tokio::time::sleep(*delay).await;
                }
                Fault::FailOnCreate { table: t } if t == table => {
                    return Err(StorageError::Backend(format!(
                        "injected failure creating rows in {table}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Every non-null foreign key of `record` must resolve in the working set.
    fn check_references(&self, table: &TableSchema, record: &Record) -> StorageResult<()> {
        for fk in &table.foreign_keys {
            let Some(value) = record.get(&fk.column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let resolved = scalar_key(value)
                .map(|key| {
                    self.working
                        .get(&fk.target)
                        .map(|rows| rows.contains_key(&key))
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !resolved {
                return Err(StorageError::ForeignKey {
                    table: table.name.clone(),
                    column: fk.column.clone(),
                    target: fk.target.clone(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert_row(&mut self, table: &TableSchema, record: Record) -> StorageResult<()> {
        let key = table.key_of(&record)?;
        self.check_references(table, &record)?;
        let rows = self.working.entry(table.name.clone()).or_default();
        if rows.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                table: table.name.clone(),
                key,
            });
        }
        rows.insert(key, record);
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn create_many(&mut self, table: &str, records: Vec<Record>) -> StorageResult<u64> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;
        self.apply_faults(&table.name).await?;

        let count = records.len() as u64;
        for record in records {
            self.insert_row(table, record)?;
        }
        Ok(count)
    }

    async fn create(
        &mut self,
        table: &str,
        record: Record,
        connect: Vec<Connect>,
    ) -> StorageResult<()> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;
        self.apply_faults(&table.name).await?;

        let owner_key = table.key_of(&record)?;
        self.insert_row(table, record)?;

        for link in connect {
            let join = schema.table(&link.relation)?;
            let (owner_col, peer_col) =
                join.join_columns_for(&table.name)
                    .ok_or_else(|| StorageError::InvalidRecord {
                        table: join.name.clone(),
                        reason: format!("not a join table for {}", table.name),
                    })?;
            for peer in link.peer_ids {
                let mut row = Record::new();
                row.insert(owner_col.to_string(), owner_key.clone().into());
                row.insert(peer_col.to_string(), peer.into());
                self.insert_row(join, row)?;
            }
        }
        Ok(())
    }

    async fn update(&mut self, table: &str, key: &str, patch: Record) -> StorageResult<()> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;

        let mut merged = self
            .working
            .get(&table.name)
            .and_then(|rows| rows.get(key))
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                table: table.name.clone(),
                key: key.to_string(),
            })?;
        merged.extend(patch);
        self.check_references(table, &merged)?;

        if table.key_of(&merged)? != key {
            return Err(StorageError::InvalidRecord {
                table: table.name.clone(),
                reason: "update may not change the row key".to_string(),
            });
        }
        if let Some(rows) = self.working.get_mut(&table.name) {
            rows.insert(key.to_string(), merged);
        }
        Ok(())
    }

    async fn delete_many(&mut self, table: &str) -> StorageResult<u64> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;

        // Restrict: refuse while rows of another table still point here.
        for (referrer, fk) in schema.referencing(&table.name) {
            if referrer.name == table.name {
                continue;
            }
            let dangling = self
                .working
                .get(&referrer.name)
                .into_iter()
                .flat_map(|rows| rows.values())
                .find_map(|row| row.get(&fk.column).filter(|v| !v.is_null()));
            if let Some(value) = dangling {
                return Err(StorageError::ForeignKey {
                    table: referrer.name.clone(),
                    column: fk.column.clone(),
                    target: table.name.clone(),
                    value: value.to_string(),
                });
            }
        }

        let removed = self
            .working
            .get_mut(&table.name)
            .map(|rows| {
                let n = rows.len() as u64;
                rows.clear();
                n
            })
            .unwrap_or(0);
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTx {
            committed, working, ..
        } = *self;
        let mut tables = committed.write().map_err(poisoned)?;
        *tables = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta,
    text: String,
}

/// In-memory snapshot store backed by a `Vec` in insertion order.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<Vec<StoredSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored payload text without touching its digest.
    pub fn overwrite_payload(&self, id: &SnapshotId, text: &str) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            if let Some(s) = snapshots.iter_mut().find(|s| s.meta.id == *id) {
                s.text = text.to_string();
            }
        }
    }

    /// Newest first; later insertions win ties.
    fn newest_first(snapshots: &[StoredSnapshot]) -> Vec<StoredSnapshot> {
        let mut ordered: Vec<StoredSnapshot> = snapshots.iter().rev().cloned().collect();
        ordered.sort_by(|a, b| b.meta.created_at.cmp(&a.meta.created_at));
        ordered
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, payload: &serde_json::Value) -> StorageResult<SnapshotDescriptor> {
        let text = serde_json::to_string(payload)?;
        let meta = SnapshotMeta::for_payload(&text, Utc::now());
        let mut snapshots = self.snapshots.lock().map_err(poisoned)?;
        snapshots.push(StoredSnapshot {
            meta: meta.clone(),
            text,
        });
        Ok(SnapshotDescriptor {
            meta,
            payload: payload.clone(),
        })
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<SnapshotMeta>> {
        let snapshots = self.snapshots.lock().map_err(poisoned)?;
        Ok(Self::newest_first(&snapshots)
            .into_iter()
            .take(limit)
            .map(|s| s.meta)
            .collect())
    }

    async fn get(&self, id: &SnapshotId) -> StorageResult<SnapshotDescriptor> {
        let snapshots = self.snapshots.lock().map_err(poisoned)?;
        let stored = snapshots
            .iter()
            .find(|s| s.meta.id == *id)
            .ok_or_else(|| StorageError::SnapshotNotFound { id: id.0.clone() })?;
        stored.meta.verify(&stored.text)?;
        Ok(SnapshotDescriptor {
            meta: stored.meta.clone(),
            payload: serde_json::from_str(&stored.text)?,
        })
    }

    async fn delete(&self, id: &SnapshotId) -> StorageResult<()> {
        let mut snapshots = self.snapshots.lock().map_err(poisoned)?;
        let before = snapshots.len();
        snapshots.retain(|s| s.meta.id != *id);
        if snapshots.len() == before {
            return Err(StorageError::SnapshotNotFound { id: id.0.clone() });
        }
        Ok(())
    }

    async fn prune(&self, keep_last: usize) -> StorageResult<u64> {
        let mut snapshots = self.snapshots.lock().map_err(poisoned)?;
        let doomed: Vec<SnapshotId> = Self::newest_first(&snapshots)
            .into_iter()
            .skip(keep_last)
            .map(|s| s.meta.id)
            .collect();
        snapshots.retain(|s| !doomed.contains(&s.meta.id));
        Ok(doomed.len() as u64)
    }
}
