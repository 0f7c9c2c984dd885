use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::schema::{SnapshotMetaRow, SnapshotRow};
use crate::storage_traits::{
    SnapshotDescriptor, SnapshotId, SnapshotMeta, SnapshotStore, StorageResult,
};
use crate::SurrealHandle;

/// SurrealDB-backed implementation of the SnapshotStore trait.
#[derive(Clone)]
pub struct SurrealSnapshotStore {
    handle: Arc<SurrealHandle>,
}

impl SurrealSnapshotStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(Arc::new(SurrealHandle::setup_db().await?)))
    }

    async fn fetch(&self, id: &SnapshotId) -> StorageResult<SnapshotRow> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * OMIT id FROM snapshots WHERE snapshot_id = $sid")
            .bind(("sid", id.0.clone()))
            .await?;
        let rows: Vec<SnapshotRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::SnapshotNotFound { id: id.0.clone() })
    }

    async fn list_all(&self) -> StorageResult<Vec<SnapshotMeta>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT snapshot_id, filename, size_bytes, digest, created_at \
                 FROM snapshots ORDER BY created_at DESC",
            )
            .await?;
        let rows: Vec<SnapshotMetaRow> = res.take(0)?;
        rows.into_iter().map(SnapshotMeta::try_from).collect()
    }
}

#[async_trait]
impl SnapshotStore for SurrealSnapshotStore {
    #[instrument(skip_all)]
    async fn save(&self, payload: &serde_json::Value) -> StorageResult<SnapshotDescriptor> {
        let text = serde_json::to_string(payload)?;
        let meta = SnapshotMeta::for_payload(&text, Utc::now());
        let row = SnapshotRow::new(&meta, text);

        let _created: Option<SnapshotRow> = self
            .handle
            .db()
            .create("snapshots")
            .content(row)
            .await?;

        debug!(id = %meta.id, size_bytes = meta.size_bytes, "snapshot stored");
        Ok(SnapshotDescriptor {
            meta,
            payload: payload.clone(),
        })
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<SnapshotMeta>> {
        let mut all = self.list_all().await?;
        all.truncate(limit);
        Ok(all)
    }

    async fn get(&self, id: &SnapshotId) -> StorageResult<SnapshotDescriptor> {
        let (meta, text) = self.fetch(id).await?.into_parts()?;
        meta.verify(&text)?;
        Ok(SnapshotDescriptor {
            meta,
            payload: serde_json::from_str(&text)?,
        })
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete(&self, id: &SnapshotId) -> StorageResult<()> {
        let mut res = self
            .handle
            .db()
            .query("DELETE snapshots WHERE snapshot_id = $sid RETURN BEFORE")
            .bind(("sid", id.0.clone()))
            .await?;
        let deleted: Vec<SnapshotMetaRow> = res.take(0)?;
        if deleted.is_empty() {
            return Err(StorageError::SnapshotNotFound { id: id.0.clone() });
        }
        Ok(())
    }

    async fn prune(&self, keep_last: usize) -> StorageResult<u64> {
        let doomed: Vec<SnapshotId> = self
            .list_all()
            .await?
            .into_iter()
            .skip(keep_last)
            .map(|m| m.id)
            .collect();
        for id in &doomed {
            self.delete(id).await?;
        }
        Ok(doomed.len() as u64)
    }
}
