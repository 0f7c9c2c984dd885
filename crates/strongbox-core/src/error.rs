//! Error types for registry configuration, snapshot capture and restore.

use std::path::PathBuf;

use strongbox_state::StorageError;
use thiserror::Error;

/// Entity registry / sequencer configuration errors.
///
/// These are startup-time invariant violations, never per-request data errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The dependency graph (self references excluded) is not acyclic.
    #[error("dependency cycle detected among entity types: {types:?}")]
    CycleDetected { types: Vec<String> },

    /// A foreign key or many-to-many relation names an undeclared type.
    #[error("entity type {entity} references unknown type {target}")]
    UnknownType { entity: String, target: String },

    /// The same type or relation name was declared twice.
    #[error("entity type declared more than once: {name}")]
    DuplicateType { name: String },
}

/// Errors produced while capturing a snapshot. No partial snapshot survives one.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Reading an entity type from the store failed.
    #[error("failed to read {entity}: {source}")]
    Store {
        entity: String,
        #[source]
        source: StorageError,
    },

    /// Persisting the finished snapshot failed.
    #[error("failed to persist snapshot: {0}")]
    Persist(#[source] StorageError),

    /// The snapshot could not be serialized.
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),

    /// Writing the export file failed.
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by restore. Every variant leaves the store untouched.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The document is structurally unusable (missing version, root data, ...).
    #[error("invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// The version tag is not one this engine can restore.
    #[error("unsupported snapshot version {found} (supported: {supported:?})")]
    UnsupportedVersion {
        found: String,
        supported: Vec<String>,
    },

    /// The entity registry is cyclic; no restore order exists.
    #[error("dependency cycle detected among entity types: {types:?}")]
    CycleDetected { types: Vec<String> },

    /// Any other registry misconfiguration.
    #[error("entity registry misconfigured: {0}")]
    Configuration(String),

    /// The backing store failed or could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The restore transaction exceeded its time budget and was rolled back.
    #[error("restore transaction exceeded {timeout_ms}ms and was rolled back")]
    TransactionTimeout { timeout_ms: u64 },

    /// A record references an id that is not part of the snapshot.
    #[error("constraint violation in {entity}: {detail}")]
    ConstraintViolation { entity: String, detail: String },

    /// No stored snapshot has the requested id.
    #[error("snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    /// A stored snapshot failed its integrity check.
    #[error("stored snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    /// Another restore holds the dataset.
    #[error("another restore is already in progress")]
    RestoreInProgress,

    /// The snapshot file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StorageError> for RestoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ForeignKey { ref table, .. } | StorageError::DuplicateKey { ref table, .. } => {
                RestoreError::ConstraintViolation {
                    entity: table.clone(),
                    detail: err.to_string(),
                }
            }
            StorageError::SnapshotNotFound { id } => RestoreError::SnapshotNotFound { id },
            StorageError::CorruptSnapshot { .. } => RestoreError::CorruptSnapshot(err.to_string()),
            other => RestoreError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<RegistryError> for RestoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CycleDetected { types } => RestoreError::CycleDetected { types },
            other => RestoreError::Configuration(other.to_string()),
        }
    }
}

/// Convenience result alias.
pub type RestoreResult<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_storage_error_maps_to_constraint_violation() {
        let err: RestoreError = StorageError::ForeignKey {
            table: "Task".to_string(),
            column: "projectId".to_string(),
            target: "Project".to_string(),
            value: "\"p9\"".to_string(),
        }
        .into();
        match err {
            RestoreError::ConstraintViolation { entity, detail } => {
                assert_eq!(entity, "Task");
                assert!(detail.contains("projectId"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_busy_store_maps_to_store_unavailable() {
        let err: RestoreError = StorageError::Busy { waited_ms: 10 }.into();
        assert!(matches!(err, RestoreError::StoreUnavailable(_)));
    }

    #[test]
    fn test_cycle_error_displays_type_names() {
        let err: RestoreError = RegistryError::CycleDetected {
            types: vec!["Invoice".to_string(), "Payment".to_string()],
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Invoice"));
        assert!(msg.contains("Payment"));
    }
}
