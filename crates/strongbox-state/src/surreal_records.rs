//! SurrealDB-backed RecordStore implementation
//!
//! Every logical table lives in the single `entity_rows` table, keyed by
//! `(table_name, row_key)`. A write transaction buffers its statements and
//! ships them as one `BEGIN TRANSACTION … COMMIT TRANSACTION` batch, so the
//! server applies all of them or none. Key uniqueness and foreign keys are
//! checked client-side against the rows visible to the transaction, which
//! are loaded per table on first use. Records are stored as JSON text.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::schema::EntityRow;
use crate::storage_traits::{
    scalar_key, Connect, Record, RecordStore, StorageResult, StoreSchema, StoreTx, TableSchema,
    TxOptions,
};
use crate::SurrealHandle;

/// SurrealDB-backed implementation of [`RecordStore`].
pub struct SurrealRecordStore {
    handle: Arc<SurrealHandle>,
    schema: Arc<StoreSchema>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl SurrealRecordStore {
    pub fn new(handle: Arc<SurrealHandle>, schema: StoreSchema) -> Self {
        Self {
            handle,
            schema: Arc::new(schema),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory(schema: StoreSchema) -> crate::Result<Self> {
        let handle = SurrealHandle::setup_db().await?;
        info!("SurrealRecordStore connected (in-memory)");
        Ok(Self::new(Arc::new(handle), schema))
    }
}

async fn load_rows(db: &Surreal<Any>, table: &str) -> StorageResult<BTreeMap<String, Record>> {
    let mut res = db
        .query("SELECT table_name, row_key, data FROM entity_rows WHERE table_name = $tbl")
        .bind(("tbl", table.to_string()))
        .await?;
    let rows: Vec<EntityRow> = res.take(0)?;
    rows.into_iter()
        .map(|row| Ok((row.row_key.clone(), row.record()?)))
        .collect()
}

#[async_trait]
impl RecordStore for SurrealRecordStore {
    fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    async fn find_many(&self, table: &str) -> StorageResult<Vec<Record>> {
        self.schema.table(table)?;
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT table_name, row_key, data FROM entity_rows \
                 WHERE table_name = $tbl ORDER BY row_key ASC",
            )
            .bind(("tbl", table.to_string()))
            .await?;
        let rows: Vec<EntityRow> = res.take(0)?;
        rows.iter().map(EntityRow::record).collect()
    }

    async fn begin(&self, options: TxOptions) -> StorageResult<Box<dyn StoreTx>> {
        let guard = tokio::time::timeout(options.max_wait, self.writer.clone().lock_owned())
            .await
            .map_err(|_| StorageError::Busy {
                waited_ms: options.max_wait.as_millis() as u64,
            })?;

        Ok(Box::new(SurrealTx {
            db: self.handle.db().clone(),
            schema: self.schema.clone(),
            rows: HashMap::new(),
            statements: Vec::new(),
            params: Vec::new(),
            _guard: guard,
        }))
    }
}

/// Buffered write transaction.
struct SurrealTx {
    db: Surreal<Any>,
    schema: Arc<StoreSchema>,
    /// Rows per table as this transaction sees them.
    rows: HashMap<String, BTreeMap<String, Record>>,
    statements: Vec<String>,
    params: Vec<(String, serde_json::Value)>,
    _guard: OwnedMutexGuard<()>,
}

impl SurrealTx {
    async fn rows_of(&mut self, table: &str) -> StorageResult<&mut BTreeMap<String, Record>> {
        if !self.rows.contains_key(table) {
            let loaded = load_rows(&self.db, table).await?;
            self.rows.insert(table.to_string(), loaded);
        }
        self.rows
            .get_mut(table)
            .ok_or_else(|| StorageError::Backend(format!("rows of {table} unavailable")))
    }

    fn push(&mut self, statement: impl FnOnce(&str) -> String, value: serde_json::Value) {
        let name = format!("p{}", self.params.len());
        self.statements.push(statement(&name));
        self.params.push((name, value));
    }

    async fn check_references(&mut self, table: &TableSchema, record: &Record) -> StorageResult<()> {
        for fk in &table.foreign_keys {
            let Some(value) = record.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let resolved = match scalar_key(value) {
                Some(key) => self.rows_of(&fk.target).await?.contains_key(&key),
                None => false,
            };
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

    /// Validate and register a row, returning the row to insert.
    async fn stage_row(&mut self, table: &TableSchema, record: Record) -> StorageResult<EntityRow> {
        let key = table.key_of(&record)?;
        self.check_references(table, &record).await?;
        let row = EntityRow::new(&table.name, key.clone(), &record)?;
        let rows = self.rows_of(&table.name).await?;
        if rows.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                table: table.name.clone(),
                key,
            });
        }
        rows.insert(key, record);
        Ok(row)
    }
}

#[async_trait]
impl StoreTx for SurrealTx {
    async fn create_many(&mut self, table: &str, records: Vec<Record>) -> StorageResult<u64> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push(self.stage_row(table, record).await?);
        }
        let count = rows.len() as u64;
        if count > 0 {
            let value = serde_json::to_value(&rows)?;
            self.push(|p| format!("INSERT INTO entity_rows ${p};"), value);
        }
        debug!(table = %table.name, count, "staged bulk insert");
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

        let owner_key = table.key_of(&record)?;
        let mut rows = vec![self.stage_row(table, record).await?];

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
                rows.push(self.stage_row(join, row).await?);
            }
        }

        let value = serde_json::to_value(&rows)?;
        self.push(|p| format!("INSERT INTO entity_rows ${p};"), value);
        Ok(())
    }

    async fn update(&mut self, table: &str, key: &str, patch: Record) -> StorageResult<()> {
        let schema = self.schema.clone();
        let table = schema.table(table)?;

        if table.key_columns.iter().any(|c| patch.contains_key(c)) {
            return Err(StorageError::InvalidRecord {
                table: table.name.clone(),
                reason: "update may not change the row key".to_string(),
            });
        }
        let mut merged = self
            .rows_of(&table.name)
            .await?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                table: table.name.clone(),
                key: key.to_string(),
            })?;
        merged.extend(patch);
        self.check_references(table, &merged).await?;

        let value = json!({
            "table": table.name,
            "key": key,
            "data": serde_json::to_string(&merged)?,
        });
        self.rows_of(&table.name).await?.insert(key.to_string(), merged);
        self.push(
            |p| {
                format!(
                    "UPDATE entity_rows SET data = ${p}.data \
                     WHERE table_name = ${p}.table AND row_key = ${p}.key;"
                )
            },
            value,
        );
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
                .rows_of(&referrer.name)
                .await?
                .values()
                .find_map(|row| row.get(&fk.column).filter(|v| !v.is_null()).cloned());
            if let Some(value) = dangling {
                return Err(StorageError::ForeignKey {
                    table: referrer.name.clone(),
                    column: fk.column.clone(),
                    target: table.name.clone(),
                    value: value.to_string(),
                });
            }
        }

        let rows = self.rows_of(&table.name).await?;
        let removed = rows.len() as u64;
        rows.clear();

        self.push(
            |p| format!("DELETE entity_rows WHERE table_name = ${p};"),
            serde_json::Value::String(table.name.clone()),
        );
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let SurrealTx {
            db,
            statements,
            params,
            ..
        } = *self;
        if statements.is_empty() {
            return Ok(());
        }

        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for statement in &statements {
            sql.push_str(statement);
            sql.push('\n');
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = db.query(sql);
        for binding in params {
            query = query.bind(binding);
        }
        query.await?.check().map_err(|e| {
            warn!(error = %e, "surreal transaction rejected");
            StorageError::from(e)
        })?;

        debug!(statements = statements.len(), "surreal transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        debug!(
            statements = self.statements.len(),
            "discarding buffered surreal transaction"
        );
        Ok(())
    }
}
