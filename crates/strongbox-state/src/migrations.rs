//! SurrealDB schema migrations and initialization
//!
//! Sets up the two tables the Surreal backends use. Safe to call multiple
//! times (idempotent).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Strongbox tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Strongbox SurrealDB schema");

    init_entity_rows_table(db).await?;
    init_snapshots_table(db).await?;

    info!("Strongbox schema initialization complete");
    Ok(())
}

/// Initialize `entity_rows` table
///
/// Schema:
/// ```text
/// TABLE entity_rows {
///   table_name:  STRING (logical table, indexed)
///   row_key:     STRING (row key within the logical table)
///   data:        STRING (record as JSON text, foreign keys as raw ids)
/// }
/// ```
///
/// Constraints:
/// - `(table_name, row_key)` is unique
/// - Foreign keys between logical tables are checked by the restore engine
async fn init_entity_rows_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing entity_rows table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS entity_rows SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_table_row ON TABLE entity_rows COLUMNS table_name, row_key UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_table_name ON TABLE entity_rows COLUMNS table_name;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("entity_rows table initialized");
    Ok(())
}

/// Initialize `snapshots` table
///
/// Schema:
/// ```text
/// TABLE snapshots {
///   snapshot_id:  STRING (unique)
///   filename:     STRING
///   size_bytes:   INT
///   digest:       STRING (sha-256 of payload)
///   created_at:   DATETIME (indexed)
///   payload:      STRING (serialized snapshot document)
/// }
/// ```
async fn init_snapshots_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing snapshots table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS snapshots SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_snapshot_id ON TABLE snapshots COLUMNS snapshot_id UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_snapshot_created_at ON TABLE snapshots COLUMNS created_at;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("snapshots table initialized");
    Ok(())
}
