//! Strongbox-State: persistence layer for the Strongbox snapshot engine
//!
//! This crate owns all I/O with the backing stores: the live relational
//! dataset that gets captured and restored, and the archive of persisted
//! snapshots.
//!
//! ## Key Components
//!
//! - `RecordStore` / `StoreTx`: schema-aware record store with one exclusive,
//!   all-or-nothing write transaction
//! - `SnapshotStore`: persisted snapshot documents with digest verification
//! - `fakes`: in-memory implementations of both (with fault injection)
//! - `SurrealHandle`: SurrealDB connection setup shared by the Surreal backends

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_records;
pub mod surreal_snapshots;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, SurrealHandle};
pub use schema::{EntityRow, SnapshotMetaRow, SnapshotRow};
pub use storage_traits::{
    scalar_key, Connect, ContentDigest, ForeignKeySchema, Record, RecordStore, SnapshotDescriptor,
    SnapshotId, SnapshotMeta, SnapshotStore, StorageResult, StoreSchema, StoreTx, TableSchema,
    TxOptions,
};
pub use surreal_records::SurrealRecordStore;
pub use surreal_snapshots::SurrealSnapshotStore;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
