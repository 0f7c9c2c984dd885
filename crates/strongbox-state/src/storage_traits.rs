//! Storage trait definitions for Strongbox
//!
//! These traits define the core storage abstractions:
//! - `RecordStore` / `StoreTx`: Schema-aware relational record store with a
//!   single exclusive unit-of-work (find / create / update / delete)
//! - `SnapshotStore`: Persisted snapshot documents (save/list/get/delete/prune)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A single stored row: scalar fields plus raw foreign-key ids.
pub type Record = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Store schema
// ---------------------------------------------------------------------------

/// Column `column` of a table holds the key of a row in `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    pub column: String,
    pub target: String,
}

/// Physical description of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Columns whose values, joined by `:`, form the row key.
    pub key_columns: Vec<String>,
    pub foreign_keys: Vec<ForeignKeySchema>,
}

impl TableSchema {
    /// A regular table keyed by its `id` column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_columns: vec!["id".to_string()],
            foreign_keys: Vec::new(),
        }
    }

    /// An implicit many-to-many join table: `A` references `a`,
    /// `B` references `b`, keyed by the pair.
    pub fn join(name: impl Into<String>, a: &str, b: &str) -> Self {
        Self {
            name: name.into(),
            key_columns: vec!["A".to_string(), "B".to_string()],
            foreign_keys: vec![
                ForeignKeySchema {
                    column: "A".to_string(),
                    target: a.to_string(),
                },
                ForeignKeySchema {
                    column: "B".to_string(),
                    target: b.to_string(),
                },
            ],
        }
    }

    /// Add a foreign key column.
    pub fn with_foreign_key(mut self, column: impl Into<String>, target: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKeySchema {
            column: column.into(),
            target: target.into(),
        });
        self
    }

    pub fn is_join(&self) -> bool {
        self.key_columns.len() == 2 && self.key_columns[0] == "A" && self.key_columns[1] == "B"
    }

    /// Compute the row key of `record`.
    pub fn key_of(&self, record: &Record) -> StorageResult<String> {
        let mut parts = Vec::with_capacity(self.key_columns.len());
        for column in &self.key_columns {
            let part = record
                .get(column)
                .and_then(scalar_key)
                .ok_or_else(|| StorageError::InvalidRecord {
                    table: self.name.clone(),
                    reason: format!("missing key column '{column}'"),
                })?;
            parts.push(part);
        }
        Ok(parts.join(":"))
    }

    /// For a join table, the `(owner column, peer column)` pair seen from
    /// `owner_table`.
    pub fn join_columns_for(&self, owner_table: &str) -> Option<(&str, &str)> {
        if !self.is_join() {
            return None;
        }
        let a = &self.foreign_keys[0];
        let b = &self.foreign_keys[1];
        if a.target == owner_table {
            Some((a.column.as_str(), b.column.as_str()))
        } else if b.target == owner_table {
            Some((b.column.as_str(), a.column.as_str()))
        } else {
            None
        }
    }
}

/// Render a key / foreign-key value as a string. `null` yields `None`.
pub fn scalar_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The full set of tables a record store manages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    tables: Vec<TableSchema>,
}

impl StoreSchema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Look up a table, failing with `UnknownTable`.
    pub fn table(&self, name: &str) -> StorageResult<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| StorageError::UnknownTable {
                table: name.to_string(),
            })
    }

    /// All `(table, foreign key)` pairs pointing at `target`.
    pub fn referencing<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a TableSchema, &'a ForeignKeySchema)> + 'a {
        self.tables.iter().flat_map(move |t| {
            t.foreign_keys
                .iter()
                .filter(move |fk| fk.target == target)
                .map(move |fk| (t, fk))
        })
    }
}

// ---------------------------------------------------------------------------
// RecordStore: transactional relational store
// ---------------------------------------------------------------------------

/// Wait/timeout budget for one write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// How long `begin` may wait for the exclusive write slot.
    pub max_wait: Duration,
    /// Upper bound on the whole transaction, enforced by the caller.
    pub timeout: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Attach a freshly created record to peers through a join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Join table name
    pub relation: String,
    /// Keys of the peer rows
    pub peer_ids: Vec<String>,
}

/// Schema-aware relational record store.
///
/// Guarantees:
/// - Reads outside a transaction observe committed state only.
/// - At most one write transaction is open at a time.
/// - Foreign keys declared in the schema are never left dangling by a
///   committed transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// The tables this store manages.
    fn schema(&self) -> &StoreSchema;

    /// All committed rows of `table`, ordered by row key.
    async fn find_many(&self, table: &str) -> StorageResult<Vec<Record>>;

    /// Open the exclusive write transaction, waiting at most `options.max_wait`.
    async fn begin(&self, options: TxOptions) -> StorageResult<Box<dyn StoreTx>>;
}

/// One open unit-of-work. Dropping it without `commit` discards every change.
#[async_trait]
pub trait StoreTx: Send {
    /// Bulk insert without relation connect. Returns the number of rows.
    async fn create_many(&mut self, table: &str, records: Vec<Record>) -> StorageResult<u64>;

    /// Insert one row and connect it to peers through join tables.
    async fn create(
        &mut self,
        table: &str,
        record: Record,
        connect: Vec<Connect>,
    ) -> StorageResult<()>;

    /// Merge `patch` into the row with key `key`.
    async fn update(&mut self, table: &str, key: &str, patch: Record) -> StorageResult<()>;

    /// Delete every row of `table`. Returns the number of rows removed.
    async fn delete_many(&mut self, table: &str) -> StorageResult<u64>;

    /// Apply all changes atomically.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discard all changes.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// SnapshotStore: persisted snapshot documents
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    /// Generate a new random SnapshotId
    pub fn new() -> Self {
        SnapshotId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listing view of a stored snapshot (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub filename: String,
    pub size_bytes: u64,
    pub digest: ContentDigest,
    pub created_at: DateTime<Utc>,
}

impl SnapshotMeta {
    /// Describe a serialized payload about to be stored.
    pub fn for_payload(text: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: SnapshotId::new(),
            filename: format!("backup-{}.json", created_at.format("%Y%m%d-%H%M%S")),
            size_bytes: text.len() as u64,
            digest: ContentDigest::from_bytes(text.as_bytes()),
            created_at,
        }
    }

    /// Check `text` against the recorded digest.
    pub fn verify(&self, text: &str) -> StorageResult<()> {
        let actual = ContentDigest::from_bytes(text.as_bytes());
        if actual != self.digest {
            return Err(StorageError::CorruptSnapshot {
                id: self.id.0.clone(),
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// A stored snapshot: metadata plus the full document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    #[serde(flatten)]
    pub meta: SnapshotMeta,
    pub payload: serde_json::Value,
}

/// Persisted snapshot documents.
///
/// Guarantees:
/// - Stored payloads are immutable; `get` verifies them against their digest.
/// - `list` returns newest first.
/// - `prune(n)` keeps the `n` newest snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a serialized snapshot document.
    async fn save(&self, payload: &serde_json::Value) -> StorageResult<SnapshotDescriptor>;

    /// Metadata of the newest `limit` snapshots.
    async fn list(&self, limit: usize) -> StorageResult<Vec<SnapshotMeta>>;

    /// Full snapshot by ID. Returns `SnapshotNotFound` if absent.
    async fn get(&self, id: &SnapshotId) -> StorageResult<SnapshotDescriptor>;

    /// Delete a snapshot by ID. Returns `SnapshotNotFound` if absent.
    async fn delete(&self, id: &SnapshotId) -> StorageResult<()>;

    /// Keep the newest `keep_last` snapshots; returns how many were deleted.
    async fn prune(&self, keep_last: usize) -> StorageResult<u64>;
}
