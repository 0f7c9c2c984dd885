//! Error types for strongbox-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the record store and snapshot store traits
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Opaque backend failure (I/O, query engine, network)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A write transaction could not be started within its wait budget
    #[error("store busy: no write transaction available after {waited_ms}ms")]
    Busy { waited_ms: u64 },

    /// Table is not part of the store schema
    #[error("unknown table: {table}")]
    UnknownTable { table: String },

    /// Record shape does not fit the table (missing key column, not an object)
    #[error("invalid record for {table}: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// A record with the same key already exists
    #[error("duplicate key {key} in {table}")]
    DuplicateKey { table: String, key: String },

    /// Record addressed by key does not exist
    #[error("record {key} not found in {table}")]
    RecordNotFound { table: String, key: String },

    /// A foreign key points at a missing row, or a delete would orphan rows
    #[error("foreign key violation on {table}.{column} -> {target}: {value}")]
    ForeignKey {
        table: String,
        column: String,
        target: String,
        value: String,
    },

    /// Stored snapshot does not exist
    #[error("snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    /// Stored snapshot payload does not match its recorded digest
    #[error("snapshot {id} is corrupt: expected digest {expected}, found {actual}")]
    CorruptSnapshot {
        id: String,
        expected: String,
        actual: String,
    },

    /// Digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Payload could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl StorageError {
    /// True for referential-integrity failures raised by the store.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            StorageError::ForeignKey { .. } | StorageError::DuplicateKey { .. }
        )
    }
}
