//! `BackupService`: the entry point binaries talk to.
//!
//! Wires a registry, a record store and a snapshot archive together and
//! exposes capture, archive management and restore.

use std::path::Path;
use std::sync::Arc;

use strongbox_state::{
    RecordStore, SnapshotId, SnapshotMeta, SnapshotStore, StorageResult,
};
use tracing::instrument;

use crate::builder::SnapshotBuilder;
use crate::config::EngineConfig;
use crate::error::{BuildError, RegistryError, RestoreError, RestoreResult};
use crate::obs;
use crate::registry::EntityRegistry;
use crate::restore::{RestoreExecutor, RestoreReport};
use crate::sequencer::DependencySequencer;
use crate::snapshot::Snapshot;

pub struct BackupService {
    registry: Arc<EntityRegistry>,
    sequencer: Arc<DependencySequencer>,
    builder: SnapshotBuilder,
    executor: RestoreExecutor,
    snapshots: Arc<dyn SnapshotStore>,
    config: EngineConfig,
}

impl BackupService {
    /// Fails when the registry has no valid insert order.
    pub fn new(
        registry: EntityRegistry,
        store: Arc<dyn RecordStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> Result<Self, RegistryError> {
        let sequencer = Arc::new(DependencySequencer::new(&registry)?);
        let registry = Arc::new(registry);
        for t in registry.all_types() {
            if store.schema().table(&t.name).is_err() {
                return Err(RegistryError::UnknownType {
                    entity: "<store>".to_string(),
                    target: t.name.clone(),
                });
            }
        }
        Ok(Self {
            builder: SnapshotBuilder::new(registry.clone(), store.clone()),
            executor: RestoreExecutor::new(
                registry.clone(),
                sequencer.clone(),
                store,
                config.tx_options(),
                config.busy_policy,
            ),
            registry,
            sequencer,
            snapshots,
            config,
        })
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn sequencer(&self) -> &DependencySequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Capture the dataset without persisting it.
    pub async fn build(&self) -> Result<Snapshot, BuildError> {
        self.builder.build().await
    }

    /// Capture, persist, then apply the retention limit if one is configured.
    #[instrument(skip(self))]
    pub async fn backup(&self) -> Result<SnapshotMeta, BuildError> {
        let snapshot = self.build().await?;
        let payload = snapshot
            .to_value()
            .map_err(|e| BuildError::Serialization(e.to_string()))?;
        let stored = self
            .snapshots
            .save(&payload)
            .await
            .map_err(BuildError::Persist)?;
        obs::emit_backup_created(
            &stored.meta.id.0,
            &stored.meta.filename,
            stored.meta.size_bytes,
            snapshot.record_count(),
        );

        if let Some(keep) = self.config.retain_last {
            let removed = self.snapshots.prune(keep).await.map_err(BuildError::Persist)?;
            if removed > 0 {
                obs::emit_backup_pruned(removed, keep);
            }
        }
        Ok(stored.meta)
    }

    /// Capture and render as the pretty-printed export format.
    pub async fn export_json(&self) -> Result<String, BuildError> {
        self.build()
            .await?
            .to_json_pretty()
            .map_err(|e| BuildError::Serialization(e.to_string()))
    }

    /// Capture and write the export to `path`.
    pub async fn export_to(&self, path: &Path) -> Result<(), BuildError> {
        let text = self.export_json().await?;
        tokio::fs::write(path, text)
            .await
            .map_err(|source| BuildError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    pub async fn restore(&self, snapshot: &Snapshot) -> RestoreResult<RestoreReport> {
        self.executor.restore(snapshot).await
    }

    /// Restore from an uploaded / on-disk JSON document.
    pub async fn restore_json(&self, bytes: &[u8]) -> RestoreResult<RestoreReport> {
        let snapshot = Snapshot::from_json(bytes)?;
        self.executor.restore_from(&snapshot, "upload").await
    }

    pub async fn restore_file(&self, path: &Path) -> RestoreResult<RestoreReport> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| RestoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let snapshot = Snapshot::from_json(&bytes)?;
        let source = format!("file:{}", path.display());
        self.executor.restore_from(&snapshot, &source).await
    }

    /// Restore a snapshot from the archive after verifying its digest.
    pub async fn restore_by_id(&self, id: &SnapshotId) -> RestoreResult<RestoreReport> {
        let snapshot = self.get(id).await?;
        let source = format!("snapshot:{id}");
        self.executor.restore_from(&snapshot, &source).await
    }

    pub async fn list(&self, limit: usize) -> StorageResult<Vec<SnapshotMeta>> {
        self.snapshots.list(limit).await
    }

    /// Load and parse an archived snapshot.
    pub async fn get(&self, id: &SnapshotId) -> RestoreResult<Snapshot> {
        let descriptor = self.snapshots.get(id).await?;
        Snapshot::from_value(descriptor.payload)
    }

    pub async fn delete(&self, id: &SnapshotId) -> StorageResult<()> {
        self.snapshots.delete(id).await
    }

    pub async fn prune(&self, keep_last: usize) -> StorageResult<u64> {
        let removed = self.snapshots.prune(keep_last).await?;
        obs::emit_backup_pruned(removed, keep_last);
        Ok(removed)
    }
}
