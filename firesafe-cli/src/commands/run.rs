//! Run command implementation.

use anyhow::{Context, Result};
use firesafe::api::RestClient;
use firesafe::checkpoint::CHECKPOINT_FILE;
use firesafe::sources::build_exporters;
use firesafe::{ExportConfig, ExportProgress, Orchestrator};
use firesafe_storage::LocalStorage;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

/// Exit code when the run finished but at least one source failed.
const EXIT_SOURCE_FAILED: u8 = 2;

/// Run (or resume) the export described by `config`.
pub async fn run_export(config: ExportConfig, assume_yes: bool) -> Result<ExitCode> {
    let sources = config.enabled_sources();
    if sources.is_empty() {
        anyhow::bail!(
            "No sources to export. Enable a source under [export.sources] \
             (storage needs firebase.storage_bucket, realtime_db needs firebase.realtime_db_url)."
        );
    }

    let resuming = config.checkpoint_path().exists();
    print_plan(&config, resuming);

    if !assume_yes && !confirm()? {
        println!("Export cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let token = config.access_token()?;
    let client = Arc::new(
        RestClient::new(&config, &token).context("Failed to build the platform API client")?,
    );

    let show_progress = config.observability.show_progress;
    let output_dir = config.export.output_dir.clone();
    let config = Arc::new(config);
    let exporters = build_exporters(&config, client);
    let storage = Arc::new(LocalStorage::new(&output_dir));

    let orchestrator = Orchestrator::open(config, exporters, storage)
        .await
        .with_context(|| format!("Failed to open checkpoint in {}", output_dir.display()))?
        .with_progress(Arc::new(ExportProgress::new(show_progress)));

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after in-flight batches");
            cancel.cancel();
        }
    });

    let summary = orchestrator
        .run()
        .await
        .context("Export aborted; progress up to the last saved checkpoint is kept")?;

    println!();
    print!("{}", summary);
    println!("Output: {}", output_dir.display());

    if summary.any_failed() {
        println!("Some sources failed; fix the cause and run again to resume them.");
        return Ok(ExitCode::from(EXIT_SOURCE_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_plan(config: &ExportConfig, resuming: bool) {
    println!("About to export from project: {}", config.firebase.project_id);
    println!("  Output directory:   {}", config.export.output_dir.display());
    for kind in config.enabled_sources() {
        match config.ceiling(kind) {
            Some(limit) => println!("  {:<18}  up to {} reads", kind.as_str(), limit),
            None => println!("  {:<18}  no read limit", kind.as_str()),
        }
    }
    if config.export.include_storage_files {
        println!(
            "  Storage files:      downloaded (skipping files of {} MB or more)",
            config.export.max_storage_file_size_mb
        );
    }
    if resuming {
        println!(
            "  Resuming from:      {}",
            config.export.output_dir.join(CHECKPOINT_FILE).display()
        );
    }
}

fn confirm() -> Result<bool> {
    print!("\nProceed with export? (yes/no): ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
