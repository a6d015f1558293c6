//! Status command implementation.

use anyhow::{Context, Result};
use firesafe::checkpoint::{CheckpointStore, ARCHIVED_CHECKPOINT_FILE};
use firesafe::summary::SUMMARY_FILE;
use firesafe::{Checkpoint, ExportConfig, FileCheckpointStore};
use firesafe_storage::{ArtifactPath, ArtifactStorage, LocalStorage};
use std::sync::Arc;

/// Print the checkpoint of the configured export directory.
pub async fn run_status(config: &ExportConfig, json: bool) -> Result<()> {
    let output_dir = &config.export.output_dir;
    let storage: Arc<dyn ArtifactStorage> = Arc::new(LocalStorage::new(output_dir));
    let store = FileCheckpointStore::new(storage.clone());

    let checkpoint = store
        .load()
        .await
        .with_context(|| format!("Failed to read checkpoint in {}", output_dir.display()))?;

    match checkpoint {
        Some(checkpoint) if json => {
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        Some(checkpoint) => print_checkpoint(&checkpoint),
        None => {
            let archived = storage
                .exists(&ArtifactPath::run_file(ARCHIVED_CHECKPOINT_FILE))
                .await?;
            if archived {
                println!(
                    "Last export in {} completed; see {}",
                    output_dir.display(),
                    output_dir.join(SUMMARY_FILE).display()
                );
            } else {
                println!("No export found in {}", output_dir.display());
            }
        }
    }
    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!();
    println!("Checkpoint for project '{}'", checkpoint.project_id);
    println!("  Started:  {}", checkpoint.created_at);
    println!("  Updated:  {}", checkpoint.updated_at);
    println!();
    println!(
        "{:<12} {:<15} {:>10} {:>8} {:>8}  {}",
        "SOURCE", "STATUS", "RECORDS", "SKIPPED", "BATCHES", "RESUMES AT"
    );
    println!("--------------------------------------------------------------------------------");
    for (kind, progress) in &checkpoint.sources {
        let resumes_at = match &progress.cursor {
            Some(_) => "saved cursor",
            None if progress.batches_committed == 0 => "start",
            None => "-",
        };
        println!(
            "{:<12} {:<15} {:>10} {:>8} {:>8}  {}",
            kind.as_str(),
            progress.status.as_str(),
            progress.records_processed,
            progress.records_skipped,
            progress.batches_committed,
            resumes_at
        );
        if let Some(failure) = &progress.failure {
            println!("  {} failure at {}: {}", failure.class, failure.at, failure.message);
        }
    }
    println!();
}
