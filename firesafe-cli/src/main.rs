use anyhow::Result;
use clap::{Parser, Subcommand};
use firesafe::ExportConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "firesafe")]
#[command(about = "Resumable, cost-bounded export of a Firebase project")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an export, resuming from the checkpoint when one exists
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "firesafe.toml")]
        config: PathBuf,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Override export.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the checkpoint of an export directory
    Status {
        /// Configuration file path
        #[arg(short, long, default_value = "firesafe.toml")]
        config: PathBuf,

        /// Override export.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the raw checkpoint as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Set up tracing from RUST_LOG / LOG_FORMAT, falling back to the config.
fn init_tracing(config: &ExportConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.observability.log_level.clone());
    let format =
        std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.observability.log_format.clone());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: &std::path::Path, output: Option<PathBuf>) -> Result<ExportConfig> {
    let mut config = ExportConfig::load(path)?;
    if let Some(dir) = output {
        config.export.output_dir = firesafe::config::expand_tilde(&dir)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            yes,
            output,
        } => {
            let config = load_config(&config, output)?;
            init_tracing(&config);
            commands::run_export(config, yes).await
        }
        Commands::Status {
            config,
            output,
            json,
        } => {
            let config = load_config(&config, output)?;
            init_tracing(&config);
            commands::run_status(&config, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
