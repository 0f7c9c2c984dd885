//! The portable snapshot document.
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "users": [ { "id": "u1", ... } ],
//!   "opportunities": [ { "id": "o1", "featureIds": ["f1", "f2"], ... } ]
//! }
//! ```
//!
//! Every key other than `version` and `timestamp` holds the records of one
//! entity type under its export key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use strongbox_state::Record;

use crate::error::{RestoreError, RestoreResult};

/// Version tag written into every new snapshot.
pub const SNAPSHOT_FORMAT_VERSION: &str = "1.0";

/// Versions restore accepts.
pub const SUPPORTED_VERSIONS: &[&str] = &[SNAPSHOT_FORMAT_VERSION];

/// A full, versioned, point-in-time copy of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entities: BTreeMap<String, Vec<Record>>,
}

impl Snapshot {
    /// An empty snapshot in the current format.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION.to_string(),
            timestamp,
            entities: BTreeMap::new(),
        }
    }

    /// Records stored under `export_key` (empty when absent).
    pub fn records(&self, export_key: &str) -> &[Record] {
        self.entities
            .get(export_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of records across all types.
    pub fn record_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    pub fn is_supported_version(version: &str) -> bool {
        SUPPORTED_VERSIONS.contains(&version)
    }

    /// Fail with `UnsupportedVersion` unless this snapshot's version is known.
    pub fn check_version(&self) -> RestoreResult<()> {
        if Self::is_supported_version(&self.version) {
            return Ok(());
        }
        Err(RestoreError::UnsupportedVersion {
            found: self.version.clone(),
            supported: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        })
    }

    /// Parse raw JSON bytes.
    pub fn from_json(bytes: &[u8]) -> RestoreResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RestoreError::InvalidFormat(format!("not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Interpret a JSON document.
    ///
    /// Only structure is checked here: the version tag, the timestamp and that
    /// every other key holds a list of objects. Registry-level checks happen
    /// in the restore executor.
    pub fn from_value(value: Value) -> RestoreResult<Self> {
        let Value::Object(mut doc) = value else {
            return Err(RestoreError::InvalidFormat(
                "snapshot must be a JSON object".to_string(),
            ));
        };

        let version = match doc.remove("version") {
            Some(Value::String(v)) => v,
            Some(_) => {
                return Err(RestoreError::InvalidFormat(
                    "version must be a string".to_string(),
                ))
            }
            None => return Err(RestoreError::InvalidFormat("missing version".to_string())),
        };
        if !Self::is_supported_version(&version) {
            return Err(RestoreError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            });
        }

        let timestamp = match doc.remove("timestamp") {
            Some(Value::String(ts)) => DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| RestoreError::InvalidFormat(format!("bad timestamp '{ts}': {e}")))?,
            Some(_) => {
                return Err(RestoreError::InvalidFormat(
                    "timestamp must be an RFC 3339 string".to_string(),
                ))
            }
            None => return Err(RestoreError::InvalidFormat("missing timestamp".to_string())),
        };

        let mut entities = BTreeMap::new();
        for (key, value) in doc {
            let Value::Array(items) = value else {
                return Err(RestoreError::InvalidFormat(format!(
                    "'{key}' must be a list of records"
                )));
            };
            let mut records = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(record) => records.push(record),
                    _ => {
                        return Err(RestoreError::InvalidFormat(format!(
                            "'{key}[{i}]' is not an object"
                        )))
                    }
                }
            }
            entities.insert(key, records);
        }

        Ok(Self {
            version,
            timestamp,
            entities,
        })
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Human-readable JSON, the on-disk export format.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
