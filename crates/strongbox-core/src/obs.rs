//! Structured lifecycle events for backup and restore.
//!
//! Every event carries an `event` field (`backup.created`, `restore.started`,
//! `restore.finished`, `restore.failed`) so log pipelines can filter on it.

use tracing::{info, warn};

use crate::restore::RestoreReport;

/// Span tagging everything logged during one restore. Attach it with
/// [`tracing::Instrument`] so it follows the future across await points.
pub fn restore_span(source: &str) -> tracing::Span {
    tracing::info_span!("strongbox.restore", source = %source)
}

pub fn emit_backup_created(snapshot_id: &str, filename: &str, size_bytes: u64, records: usize) {
    info!(
        event = "backup.created",
        snapshot_id = %snapshot_id,
        filename = %filename,
        size_bytes = size_bytes,
        records = records,
    );
}

pub fn emit_backup_pruned(removed: u64, kept: usize) {
    info!(event = "backup.pruned", removed = removed, kept = kept);
}

/// Emit event: restore accepted (validation passed, transaction about to open).
pub fn emit_restore_started(source: &str, version: &str, records: usize) {
    info!(
        event = "restore.started",
        source = %source,
        version = %version,
        records = records,
    );
}

pub fn emit_restore_finished(source: &str, report: &RestoreReport) {
    info!(
        event = "restore.finished",
        source = %source,
        inserted = report.total_inserted(),
        deleted = report.total_deleted(),
        links = report.links_connected,
        self_links = report.self_links_patched,
        duration_ms = report.elapsed_ms,
    );
}

/// Emit event: restore aborted; the dataset is unchanged.
pub fn emit_restore_failed(source: &str, error: &dyn std::fmt::Display) {
    warn!(event = "restore.failed", source = %source, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_span_create() {
        let _span = restore_span("file:backup.json").entered();
        emit_restore_failed("file:backup.json", &"boom");
    }
}
