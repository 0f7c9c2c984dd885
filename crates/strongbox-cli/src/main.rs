//! Strongbox CLI
//!
//! The `strongbox` command captures and restores the full business dataset.
//!
//! ## Commands
//!
//! - `export`: Write a snapshot of the live dataset as pretty JSON
//! - `backup`: Capture and archive a snapshot
//! - `list` / `show` / `delete` / `prune`: Manage archived snapshots
//! - `restore`: Replace the dataset from a file or an archived snapshot
//! - `order`: Print the dependency order restore uses

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strongbox_core::{BackupService, EngineConfig, EntityRegistry, RestoreReport};
use strongbox_state::{SnapshotId, SurrealHandle, SurrealRecordStore, SurrealSnapshotStore};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "strongbox")]
#[command(author = "Strongbox Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Full-dataset backup and restore", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the live dataset and print it (or write it to a file)
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Capture the live dataset and store it in the archive
    Backup {
        /// Keep only this many snapshots afterwards
        #[arg(long, env = "STRONGBOX_RETAIN_LAST")]
        keep: Option<usize>,
    },

    /// List archived snapshots, newest first
    List {
        /// Maximum number of snapshots to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Print an archived snapshot
    Show {
        /// Snapshot ID
        id: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an archived snapshot
    Delete {
        /// Snapshot ID
        id: String,
    },

    /// Delete all but the newest snapshots
    Prune {
        /// Number of snapshots to keep
        #[arg(long)]
        keep: usize,
    },

    /// Replace the entire dataset with a snapshot
    Restore {
        /// Snapshot file to restore
        #[arg(short, long, conflicts_with = "id", required_unless_present = "id")]
        file: Option<PathBuf>,

        /// Archived snapshot ID to restore
        #[arg(long)]
        id: Option<String>,

        /// Transaction timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the order entity types are inserted in
    Order,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    strongbox_core::init_tracing(cli.json, level);

    let mut config = EngineConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("Invalid Strongbox configuration")?;
    match &cli.command {
        Commands::Backup { keep: Some(keep) } => config.retain_last = Some(*keep),
        Commands::Restore {
            timeout: Some(secs),
            ..
        } => config.tx_timeout = Duration::from_secs(*secs),
        _ => {}
    }

    let service = connect(config).await?;

    match cli.command {
        Commands::Export { output } => cmd_export(&service, output.as_deref()).await,
        Commands::Backup { .. } => cmd_backup(&service).await,
        Commands::List { limit } => cmd_list(&service, limit).await,
        Commands::Show { id, output } => cmd_show(&service, &id, output.as_deref()).await,
        Commands::Delete { id } => cmd_delete(&service, &id).await,
        Commands::Prune { keep } => cmd_prune(&service, keep).await,
        Commands::Restore { file, id, .. } => {
            cmd_restore(&service, file.as_deref(), id.as_deref()).await
        }
        Commands::Order => cmd_order(&service),
    }
}

/// Open the database and wire the backup service over it.
async fn connect(config: EngineConfig) -> Result<BackupService> {
    let handle = Arc::new(
        SurrealHandle::setup_from_env()
            .await
            .context("Failed to connect to Strongbox database")?,
    );
    let registry = EntityRegistry::business().context("Entity registry is invalid")?;
    let records = Arc::new(SurrealRecordStore::new(handle.clone(), registry.store_schema()));
    let snapshots = Arc::new(SurrealSnapshotStore::new(handle));
    BackupService::new(registry, records, snapshots, config)
        .context("Failed to initialise backup service")
}

async fn cmd_export(service: &BackupService, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            service
                .export_to(path)
                .await
                .context(format!("Failed to export to {:?}", path))?;
            println!("Exported dataset to {:?}", path);
        }
        None => {
            let text = service.export_json().await.context("Failed to capture dataset")?;
            println!("{}", text);
        }
    }
    Ok(())
}

async fn cmd_backup(service: &BackupService) -> Result<()> {
    let meta = service.backup().await.context("Backup failed")?;
    println!("Created snapshot {}", meta.id);
    println!("  File:    {}", meta.filename);
    println!("  Size:    {} bytes", meta.size_bytes);
    println!("  Digest:  {}", meta.digest.short());
    Ok(())
}

async fn cmd_list(service: &BackupService, limit: usize) -> Result<()> {
    let snapshots = service.list(limit).await?;

    if snapshots.is_empty() {
        println!("No snapshots found. Run 'strongbox backup' first.");
        return Ok(());
    }

    for meta in snapshots {
        println!(
            "{}  {}  {:>10} bytes  {}",
            meta.id,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            meta.size_bytes,
            meta.filename
        );
    }
    Ok(())
}

async fn cmd_show(service: &BackupService, id: &str, output: Option<&Path>) -> Result<()> {
    let snapshot = service
        .get(&SnapshotId(id.to_string()))
        .await
        .context(format!("Snapshot not readable: {}", id))?;
    let text = snapshot.to_json_pretty()?;

    if let Some(path) = output {
        std::fs::write(path, &text).context(format!("Failed to write to {:?}", path))?;
        println!("Wrote snapshot {} to {:?}", id, path);
    } else {
        println!("{}", text);
    }
    Ok(())
}

async fn cmd_delete(service: &BackupService, id: &str) -> Result<()> {
    service
        .delete(&SnapshotId(id.to_string()))
        .await
        .context(format!("Failed to delete snapshot '{}'", id))?;
    println!("Deleted snapshot '{}'", id);
    Ok(())
}

async fn cmd_prune(service: &BackupService, keep: usize) -> Result<()> {
    let removed = service.prune(keep).await.context("Prune failed")?;
    println!("Removed {} snapshot(s), kept at most {}", removed, keep);
    Ok(())
}

async fn cmd_restore(
    service: &BackupService,
    file: Option<&Path>,
    id: Option<&str>,
) -> Result<()> {
    let report = match (file, id) {
        (Some(path), _) => service
            .restore_file(path)
            .await
            .context(format!("Restore from {:?} failed", path))?,
        (None, Some(id)) => service
            .restore_by_id(&SnapshotId(id.to_string()))
            .await
            .context(format!("Restore of snapshot {} failed", id))?,
        (None, None) => anyhow::bail!("either --file or --id is required"),
    };
    info!(inserted = report.total_inserted(), "restore complete");
    print_report(&report);
    Ok(())
}

fn print_report(report: &RestoreReport) {
    println!(
        "Restored {} record(s) in {} ms ({} removed)",
        report.total_inserted(),
        report.elapsed_ms,
        report.total_deleted()
    );
    for (entity, count) in report.inserted.iter().filter(|(_, n)| **n > 0) {
        println!("  {:<22} {}", entity, count);
    }
    println!("  links connected: {}", report.links_connected);
    println!("  self links:      {}", report.self_links_patched);
}

fn cmd_order(service: &BackupService) -> Result<()> {
    let registry = service.registry();
    for (pos, name) in service.sequencer().insert_order().iter().enumerate() {
        let Some(entity) = registry.get(name) else {
            continue;
        };
        let mut notes = Vec::new();
        if entity.is_join() {
            notes.push("join".to_string());
        }
        if let Some(column) = &entity.self_reference {
            notes.push(format!("self: {}", column));
        }
        let deps = entity.dependencies();
        if !deps.is_empty() {
            notes.push(format!("after: {}", deps.join(", ")));
        }
        println!("{:>3}. {:<24} {}", pos + 1, name, notes.join("; "));
    }
    let delete: Vec<&str> = service.sequencer().delete_order().collect();
    println!("\nDelete order: {}", delete.join(" → "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strongbox_state::fakes::{MemoryRecordStore, MemorySnapshotStore};

    fn memory_service() -> (Arc<MemoryRecordStore>, BackupService) {
        let registry = EntityRegistry::business().unwrap();
        let store = Arc::new(MemoryRecordStore::new(registry.store_schema()));
        let service = BackupService::new(
            registry,
            store.clone(),
            Arc::new(MemorySnapshotStore::new()),
            EngineConfig::default(),
        )
        .unwrap();
        (store, service)
    }

    fn write_dataset(dir: &Path) -> PathBuf {
        let path = dir.join("dataset.json");
        let doc = json!({
            "version": "1.0",
            "timestamp": "2024-05-01T12:00:00Z",
            "users": [{"id": "u1", "email": "ada@example.com"}],
            "projects": [{"id": "p1", "ownerId": "u1"}],
            "tasks": [
                {"id": "t1", "projectId": "p1", "parentId": null},
                {"id": "t2", "projectId": "p1", "parentId": "t1"}
            ]
        });
        std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_restore_from_file_then_backup_and_list() {
        let (store, service) = memory_service();
        let dir = tempfile::tempdir().unwrap();
        let path = write_dataset(dir.path());

        cmd_restore(&service, Some(&path), None).await.unwrap();
        assert_eq!(store.count("Task"), 2);

        cmd_backup(&service).await.unwrap();
        cmd_list(&service, 10).await.unwrap();
        assert_eq!(service.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_by_id_round_trips_archive() {
        let (store, service) = memory_service();
        let dir = tempfile::tempdir().unwrap();
        cmd_restore(&service, Some(&write_dataset(dir.path())), None)
            .await
            .unwrap();
        let meta = service.backup().await.unwrap();

        let out = dir.path().join("shown.json");
        cmd_show(&service, &meta.id.0, Some(&out)).await.unwrap();
        assert!(std::fs::read_to_string(&out).unwrap().contains("\"tasks\""));

        cmd_restore(&service, None, Some(&meta.id.0)).await.unwrap();
        assert_eq!(store.count("User"), 1);
    }

    #[tokio::test]
    async fn test_restore_of_missing_snapshot_fails() {
        let (_, service) = memory_service();
        let err = cmd_restore(&service, None, Some("does-not-exist"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
    }

    #[tokio::test]
    async fn test_export_writes_file_and_prune_keeps_newest() {
        let (_, service) = memory_service();
        let dir = tempfile::tempdir().unwrap();
        cmd_restore(&service, Some(&write_dataset(dir.path())), None)
            .await
            .unwrap();

        let out = dir.path().join("export.json");
        cmd_export(&service, Some(&out)).await.unwrap();
        assert!(out.exists());

        for _ in 0..3 {
            service.backup().await.unwrap();
        }
        cmd_prune(&service, 1).await.unwrap();
        let remaining = service.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        cmd_delete(&service, &remaining[0].id.0).await.unwrap();
        assert!(service.list(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_order_prints_without_error() {
        let (_, service) = memory_service();
        cmd_order(&service).unwrap();
    }

    #[test]
    fn test_restore_requires_a_source() {
        assert!(Cli::try_parse_from(["strongbox", "restore"]).is_err());
        assert!(Cli::try_parse_from(["strongbox", "restore", "--file", "a.json", "--id", "x"]).is_err());
        assert!(Cli::try_parse_from(["strongbox", "restore", "--id", "x"]).is_ok());
    }
}
