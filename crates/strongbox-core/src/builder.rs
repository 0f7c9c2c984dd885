//! Snapshot capture: read every registered entity type into one document.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use strongbox_state::{scalar_key, Record, RecordStore};
use tracing::{debug, instrument};

use crate::error::BuildError;
use crate::registry::{EntityRegistry, EntityType};
use crate::snapshot::Snapshot;

/// Reads the full dataset into a [`Snapshot`].
///
/// Many-to-many relations are exported on the owning side as a sorted list of
/// peer ids; join types are never exported under their own key.
pub struct SnapshotBuilder {
    registry: Arc<EntityRegistry>,
    store: Arc<dyn RecordStore>,
}

impl SnapshotBuilder {
    pub fn new(registry: Arc<EntityRegistry>, store: Arc<dyn RecordStore>) -> Self {
        Self { registry, store }
    }

    /// Capture the dataset. Any read failure aborts the whole build.
    #[instrument(skip(self))]
    pub async fn build(&self) -> Result<Snapshot, BuildError> {
        let mut snapshot = Snapshot::new(Utc::now());
        for entity in self.registry.record_types() {
            let mut records = self.read(&entity.name).await?;
            for relation in &entity.many_to_many {
                let links = self.peer_links(entity, &relation.relation).await?;
                for record in &mut records {
                    let peers = record
                        .get("id")
                        .and_then(scalar_key)
                        .and_then(|id| links.get(&id).cloned())
                        .unwrap_or_default();
                    record.insert(
                        relation.export_field.clone(),
                        Value::Array(peers.into_iter().map(Value::String).collect()),
                    );
                }
            }
            debug!(entity = %entity.name, count = records.len(), "captured");
            snapshot.entities.insert(entity.export_key.clone(), records);
        }
        Ok(snapshot)
    }

    async fn read(&self, table: &str) -> Result<Vec<Record>, BuildError> {
        self.store
            .find_many(table)
            .await
            .map_err(|source| BuildError::Store {
                entity: table.to_string(),
                source,
            })
    }

    /// Owner id → sorted peer ids, from the join table `relation`.
    async fn peer_links(
        &self,
        owner: &EntityType,
        relation: &str,
    ) -> Result<HashMap<String, Vec<String>>, BuildError> {
        let table = self
            .store
            .schema()
            .table(relation)
            .map_err(|source| BuildError::Store {
                entity: relation.to_string(),
                source,
            })?;
        let Some((owner_col, peer_col)) = table.join_columns_for(&owner.name) else {
            return Ok(HashMap::new());
        };

        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        for row in self.read(relation).await? {
            let (Some(o), Some(p)) = (
                row.get(owner_col).and_then(scalar_key),
                row.get(peer_col).and_then(scalar_key),
            ) else {
                continue;
            };
            links.entry(o).or_default().push(p);
        }
        for peers in links.values_mut() {
            peers.sort();
        }
        Ok(links)
    }
}
