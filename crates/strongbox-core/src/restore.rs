//! Transactional restore: replace the whole dataset with a snapshot's content.
//!
//! A restore runs in three steps:
//!
//! 1. **Validate** the document against the registry without touching the
//!    store: version, root records, record shape, duplicate ids and every
//!    reference (foreign keys, self references, many-to-many peers).
//! 2. **Delete** every type, join types included, in reverse insert order.
//! 3. **Insert** every record type in insert order:
//!    - a many-to-many relation whose peer is already inserted is connected
//!      per record at creation time;
//!    - one whose peer comes later is stripped, bulk inserted, and connected
//!      after all types are in;
//!    - self references are cleared on insert and patched in a second pass.
//!
//! Steps 2 and 3 share one store transaction bounded by the configured
//! timeout. Any failure, or the timeout, drops the transaction uncommitted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use strongbox_state::{scalar_key, Connect, Record, RecordStore, StoreTx, TxOptions};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn, Instrument};

use crate::config::BusyPolicy;
use crate::error::{RestoreError, RestoreResult};
use crate::obs;
use crate::registry::{EntityRegistry, EntityType};
use crate::sequencer::DependencySequencer;
use crate::snapshot::Snapshot;

/// What a successful restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    /// Rows removed per type during the delete phase.
    pub deleted: BTreeMap<String, u64>,
    /// Records inserted per record type.
    pub inserted: BTreeMap<String, u64>,
    /// Join rows created, immediate and deferred.
    pub links_connected: u64,
    /// Self references restored in the second pass.
    pub self_links_patched: u64,
    pub elapsed_ms: u64,
}

impl RestoreReport {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.deleted.values().sum()
    }
}

/// Join rows for one owner record, connected after every type is inserted.
#[derive(Debug)]
struct DeferredLinks {
    relation: String,
    owner: String,
    owner_id: String,
    peer_ids: Vec<String>,
}

/// Validated snapshot content keyed by type name.
pub type RestorePlan = HashMap<String, Vec<Record>>;

pub struct RestoreExecutor {
    registry: Arc<EntityRegistry>,
    sequencer: Arc<DependencySequencer>,
    store: Arc<dyn RecordStore>,
    options: TxOptions,
    busy_policy: BusyPolicy,
    gate: Mutex<()>,
}

impl RestoreExecutor {
    pub fn new(
        registry: Arc<EntityRegistry>,
        sequencer: Arc<DependencySequencer>,
        store: Arc<dyn RecordStore>,
        options: TxOptions,
        busy_policy: BusyPolicy,
    ) -> Self {
        Self {
            registry,
            sequencer,
            store,
            options,
            busy_policy,
            gate: Mutex::new(()),
        }
    }

    /// Replace the dataset with `snapshot`. All or nothing.
    pub async fn restore(&self, snapshot: &Snapshot) -> RestoreResult<RestoreReport> {
        self.restore_from(snapshot, "snapshot").await
    }

    /// Like [`restore`](Self::restore), labelling logs with `source`.
    pub async fn restore_from(
        &self,
        snapshot: &Snapshot,
        source: &str,
    ) -> RestoreResult<RestoreReport> {
        let span = obs::restore_span(source);
        let result = async {
            let plan = self.prepare(snapshot)?;
            let _exclusive = self.acquire().await?;
            obs::emit_restore_started(source, &snapshot.version, snapshot.record_count());
            self.execute(plan).await
        }
        .instrument(span)
        .await;

        match &result {
            Ok(report) => obs::emit_restore_finished(source, report),
            Err(e) => obs::emit_restore_failed(source, e),
        }
        result
    }

    async fn acquire(&self) -> RestoreResult<MutexGuard<'_, ()>> {
        match self.busy_policy {
            BusyPolicy::Wait => Ok(self.gate.lock().await),
            BusyPolicy::Reject => self
                .gate
                .try_lock()
                .map_err(|_| RestoreError::RestoreInProgress),
        }
    }

    /// Check `snapshot` against the registry. Never touches the store.
    pub fn prepare(&self, snapshot: &Snapshot) -> RestoreResult<RestorePlan> {
        snapshot.check_version()?;

        let root = self.registry.root_type();
        if snapshot.records(&root.export_key).is_empty() {
            return Err(RestoreError::InvalidFormat(format!(
                "snapshot has no {} records",
                root.export_key
            )));
        }

        let known: HashSet<&str> = self
            .registry
            .record_types()
            .map(|t| t.export_key.as_str())
            .collect();
        for key in snapshot.entities.keys() {
            if !known.contains(key.as_str()) {
                warn!(key = %key, "ignoring snapshot key with no registered entity type");
            }
        }

        let mut plan = RestorePlan::new();
        let mut ids: HashMap<&str, HashSet<String>> = HashMap::new();
        for entity in self.registry.record_types() {
            let records = snapshot.records(&entity.export_key);
            let seen = ids.entry(entity.name.as_str()).or_default();
            for (i, record) in records.iter().enumerate() {
                let id = match record.get("id") {
                    Some(Value::String(id)) if !id.is_empty() => id.clone(),
                    _ => {
                        return Err(RestoreError::InvalidFormat(format!(
                            "{}[{i}] has no string id",
                            entity.export_key
                        )))
                    }
                };
                for relation in &entity.many_to_many {
                    peer_ids(record, &relation.export_field).map_err(|reason| {
                        RestoreError::InvalidFormat(format!("{}[{i}]: {reason}", entity.export_key))
                    })?;
                }
                if !seen.insert(id.clone()) {
                    return Err(RestoreError::InvalidFormat(format!(
                        "duplicate id '{id}' in {}",
                        entity.export_key
                    )));
                }
            }
            plan.insert(entity.name.clone(), records.to_vec());
        }

        for entity in self.registry.record_types() {
            for record in snapshot.records(&entity.export_key) {
                check_references(entity, record, &ids)?;
            }
        }
        Ok(plan)
    }

    /// Open the transaction and apply `plan` within the timeout.
    async fn execute(&self, plan: RestorePlan) -> RestoreResult<RestoreReport> {
        let started = Instant::now();
        let mut tx = self.store.begin(self.options).await?;

        let work = async move {
            let mut report = RestoreReport::default();
            let applied = self.apply(tx.as_mut(), &plan, &mut report).await;
            match applied {
                Ok(()) => {
                    tx.commit().await?;
                    Ok::<_, RestoreError>(report)
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback reported an error");
                    }
                    Err(e)
                }
            }
        };

        match tokio::time::timeout(self.options.timeout, work).await {
            Ok(Ok(mut report)) => {
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                Ok(report)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RestoreError::TransactionTimeout {
                timeout_ms: self.options.timeout.as_millis() as u64,
            }),
        }
    }

    #[instrument(skip_all)]
    async fn apply(
        &self,
        tx: &mut dyn StoreTx,
        plan: &RestorePlan,
        report: &mut RestoreReport,
    ) -> RestoreResult<()> {
        for table in self.sequencer.delete_order() {
            let removed = tx.delete_many(table).await?;
            debug!(table, removed, "cleared");
            report.deleted.insert(table.to_string(), removed);
        }

        let mut deferred = Vec::new();
        for name in self.sequencer.insert_order() {
            let Some(entity) = self.registry.get(name) else {
                continue;
            };
            if entity.is_join() {
                continue;
            }
            let records = plan.get(name).cloned().unwrap_or_default();
            let count = records.len() as u64;
            if count > 0 {
                self.insert_type(tx, entity, records, &mut deferred, report)
                    .await?;
            }
            report.inserted.insert(name.clone(), count);
        }

        self.connect_deferred(tx, deferred, report).await?;
        info!(
            inserted = report.total_inserted(),
            links = report.links_connected,
            "restore applied"
        );
        Ok(())
    }

    async fn insert_type(
        &self,
        tx: &mut dyn StoreTx,
        entity: &EntityType,
        records: Vec<Record>,
        deferred: &mut Vec<DeferredLinks>,
        report: &mut RestoreReport,
    ) -> RestoreResult<()> {
        let connect_now: HashSet<&str> = entity
            .many_to_many
            .iter()
            .filter(|m| self.sequencer.precedes(&m.peer, &entity.name))
            .map(|m| m.relation.as_str())
            .collect();

        let mut rows: Vec<(Record, Vec<Connect>)> = Vec::with_capacity(records.len());
        let mut parents: Vec<(String, Value)> = Vec::new();
        for mut record in records {
            let id = record.get("id").and_then(scalar_key).unwrap_or_default();

            let mut connect = Vec::new();
            for relation in &entity.many_to_many {
                let peers = take_peer_ids(&mut record, &relation.export_field);
                if peers.is_empty() {
                    continue;
                }
                if connect_now.contains(relation.relation.as_str()) {
                    connect.push(Connect {
                        relation: relation.relation.clone(),
                        peer_ids: peers,
                    });
                } else {
                    deferred.push(DeferredLinks {
                        relation: relation.relation.clone(),
                        owner: entity.name.clone(),
                        owner_id: id.clone(),
                        peer_ids: peers,
                    });
                }
            }

            if let Some(column) = &entity.self_reference {
                if let Some(parent) = record.get_mut(column).filter(|v| !v.is_null()) {
                    parents.push((id.clone(), parent.take()));
                }
            }
            rows.push((record, connect));
        }

        if connect_now.is_empty() {
            tx.create_many(&entity.name, rows.into_iter().map(|(r, _)| r).collect())
                .await?;
        } else {
            for (record, connect) in rows {
                report.links_connected += connect.iter().map(|c| c.peer_ids.len() as u64).sum::<u64>();
                tx.create(&entity.name, record, connect).await?;
            }
        }

        if let Some(column) = &entity.self_reference {
            for (id, parent) in parents {
                let mut patch = Record::new();
                patch.insert(column.clone(), parent);
                tx.update(&entity.name, &id, patch).await?;
                report.self_links_patched += 1;
            }
        }
        Ok(())
    }

    async fn connect_deferred(
        &self,
        tx: &mut dyn StoreTx,
        deferred: Vec<DeferredLinks>,
        report: &mut RestoreReport,
    ) -> RestoreResult<()> {
        let mut by_relation: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for link in deferred {
            let table = self.store.schema().table(&link.relation)?;
            let (owner_col, peer_col) = table.join_columns_for(&link.owner).ok_or_else(|| {
                RestoreError::Configuration(format!(
                    "{} is not a join table for {}",
                    link.relation, link.owner
                ))
            })?;
            let rows = by_relation.entry(link.relation.clone()).or_default();
            for peer in link.peer_ids {
                let mut row = Record::new();
                row.insert(owner_col.to_string(), Value::String(link.owner_id.clone()));
                row.insert(peer_col.to_string(), Value::String(peer));
                rows.push(row);
            }
        }
        for (relation, rows) in by_relation {
            report.links_connected += tx.create_many(&relation, rows).await?;
        }
        Ok(())
    }
}

/// The peer ids under `field`; absent or null means none.
fn peer_ids<'a>(record: &'a Record, field: &str) -> Result<Vec<&'a str>, String> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut seen = HashSet::with_capacity(items.len());
            items
                .iter()
                .map(|v| {
                    let id = v
                        .as_str()
                        .ok_or_else(|| format!("'{field}' must contain only string ids"))?;
                    if !seen.insert(id) {
                        return Err(format!("'{field}' lists '{id}' more than once"));
                    }
                    Ok(id)
                })
                .collect()
        }
        Some(_) => Err(format!("'{field}' must be a list of ids")),
    }
}

fn take_peer_ids(record: &mut Record, field: &str) -> Vec<String> {
    match record.remove(field) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn exists(ids: &HashMap<&str, HashSet<String>>, target: &str, key: &str) -> bool {
    ids.get(target).is_some_and(|set| set.contains(key))
}

/// Every reference held by `record` must name a record in the snapshot.
fn check_references(
    entity: &EntityType,
    record: &Record,
    ids: &HashMap<&str, HashSet<String>>,
) -> RestoreResult<()> {
    let id = record.get("id").and_then(scalar_key).unwrap_or_default();
    let violation = |detail: String| RestoreError::ConstraintViolation {
        entity: entity.name.clone(),
        detail: format!("record '{id}': {detail}"),
    };
    let self_fk = entity.self_reference.iter().map(|c| (c.as_str(), entity.name.as_str(), true));
    let fks = entity
        .foreign_keys
        .iter()
        .map(|fk| (fk.column.as_str(), fk.references.as_str(), fk.nullable))
        .chain(self_fk);
    for (column, target, nullable) in fks {
        match record.get(column) {
            None | Some(Value::Null) if nullable => {}
            None | Some(Value::Null) => {
                return Err(violation(format!("required reference {column} is missing")))
            }
            Some(value) => {
                let key = scalar_key(value).ok_or_else(|| {
                    RestoreError::InvalidFormat(format!(
                        "{}.{column} of '{id}' is not a scalar id",
                        entity.name
                    ))
                })?;
                if !exists(ids, target, &key) {
                    return Err(violation(format!("{column} references missing {target} '{key}'")));
                }
            }
        }
    }

    for relation in &entity.many_to_many {
        let peers = peer_ids(record, &relation.export_field).map_err(RestoreError::InvalidFormat)?;
        if let Some(missing) = peers.iter().find(|p| !exists(ids, &relation.peer, p)) {
            return Err(violation(format!(
                "{} references missing {} '{missing}'",
                relation.export_field, relation.peer
            )));
        }
    }
    Ok(())
}
