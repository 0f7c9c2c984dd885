//! Row types for the Strongbox SurrealDB tables
//!
//! Tables:
//! - entity_rows: every record of every logical table, keyed by (table, key)
//! - snapshots: persisted snapshot documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{ContentDigest, Record, SnapshotId, SnapshotMeta, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// One record of a logical table
///
/// `data` holds the record as JSON text. SurrealDB turns a JSON `null` field
/// into NONE and drops it, so nullable columns would not survive an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRow {
    pub table_name: String,
    pub row_key: String,
    pub data: String,
}

impl EntityRow {
    pub fn new(table_name: &str, row_key: String, data: &Record) -> StorageResult<Self> {
        Ok(Self {
            table_name: table_name.to_string(),
            row_key,
            data: serde_json::to_string(data)?,
        })
    }

    /// Decode the stored record.
    pub fn record(&self) -> StorageResult<Record> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Persisted snapshot row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub snapshot_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub digest: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub payload: String,
}

impl SnapshotRow {
    pub fn new(meta: &SnapshotMeta, payload: String) -> Self {
        Self {
            snapshot_id: meta.id.0.clone(),
            filename: meta.filename.clone(),
            size_bytes: meta.size_bytes,
            digest: meta.digest.to_string(),
            created_at: meta.created_at,
            payload,
        }
    }

    /// Split into metadata and payload text.
    pub fn into_parts(self) -> StorageResult<(SnapshotMeta, String)> {
        let meta = SnapshotMeta {
            id: SnapshotId(self.snapshot_id),
            filename: self.filename,
            size_bytes: self.size_bytes,
            digest: ContentDigest::try_from(self.digest)?,
            created_at: self.created_at,
        };
        Ok((meta, self.payload))
    }
}

/// Listing projection of `snapshots` (no payload)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetaRow {
    pub snapshot_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub digest: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SnapshotMetaRow> for SnapshotMeta {
    type Error = crate::error::StorageError;

    fn try_from(row: SnapshotMetaRow) -> Result<Self, Self::Error> {
        Ok(SnapshotMeta {
            id: SnapshotId(row.snapshot_id),
            filename: row.filename,
            size_bytes: row.size_bytes,
            digest: ContentDigest::try_from(row.digest)?,
            created_at: row.created_at,
        })
    }
}
