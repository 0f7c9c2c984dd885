//! Strongbox Core Library
//!
//! Full-dataset snapshot and restore for a relational business dataset.
//!
//! - [`EntityRegistry`]: declarative entity types, foreign keys and relations
//! - [`DependencySequencer`]: deterministic insert / delete order
//! - [`SnapshotBuilder`]: capture the dataset into a versioned [`Snapshot`]
//! - [`RestoreExecutor`]: validate and apply a snapshot in one transaction
//! - [`BackupService`]: the facade binaries use

pub mod builder;
pub mod config;
pub mod error;
pub mod obs;
pub mod registry;
pub mod restore;
pub mod sequencer;
pub mod service;
pub mod snapshot;
pub mod telemetry;

pub use builder::SnapshotBuilder;
pub use config::{BusyPolicy, EngineConfig};
pub use error::{BuildError, RegistryError, RestoreError, RestoreResult};
pub use registry::{EntityKind, EntityRegistry, EntityType, ForeignKey, ManyToMany};
pub use restore::{RestoreExecutor, RestoreReport};
pub use sequencer::DependencySequencer;
pub use service::BackupService;
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION, SUPPORTED_VERSIONS};
pub use telemetry::init_tracing;
