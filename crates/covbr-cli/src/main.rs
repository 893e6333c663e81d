use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use covbr_core::PipelineError;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "covbr-cli")]
#[command(about = "Brazil COVID-19 snapshot pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured source once, persist if new, and exit.
    Run,
    /// Re-extract and validate a stored payload without persisting anything.
    Replay {
        /// Registry source id; defaults to COVBR_SOURCE.
        #[arg(long)]
        source: Option<String>,
        path: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Run)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(kind = err.kind(), error = %err, "run failed");
            eprintln!("covbr-cli: {} ({})", err, err.kind());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), PipelineError> {
    match command {
        Commands::Run => {
            let summary = covbr_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} source={} candidates={} appended={} reports={}",
                summary.run_id,
                summary.source_id,
                summary.candidates,
                summary.appended,
                summary.reports_dir
            );
        }
        Commands::Replay { source, path } => {
            let outcome = covbr_sync::replay_from_env(source, &path).await?;
            let json = serde_json::to_string_pretty(&outcome).map_err(anyhow::Error::from)?;
            println!("{json}");
        }
    }
    Ok(())
}
