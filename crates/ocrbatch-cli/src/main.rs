mod commands;
mod dotenv;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ocrbatch",
    version,
    about = "Batch OCR orchestration against a remote inference service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config YAML
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the state machine to quiescence and exit
    RunOnce,
    /// Clear failure counters so dead-lettered records run again
    ResetFailures {
        /// Clear every counter (ignores the other filters)
        #[arg(long)]
        all: bool,
        /// States to match
        #[arg(long, num_args = 1..)]
        states: Vec<String>,
        /// Schools to match (requires --states)
        #[arg(long, num_args = 1..)]
        schools: Vec<String>,
        /// Minimum year to include
        #[arg(long)]
        year_start: Option<u32>,
        /// Maximum year to include
        #[arg(long)]
        year_end: Option<u32>,
        /// Show what would be cleared without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize failure counters and logs
    Failures {
        /// Show full log rows for one record key
        #[arg(long)]
        record_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&cli.log_level);
    dotenv::load(std::path::Path::new(".env"));

    let result = match cli.command {
        Commands::RunOnce => {
            return match commands::run_once::execute(&cli.config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!("{err}");
                    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
                }
            };
        }
        Commands::ResetFailures {
            all,
            states,
            schools,
            year_start,
            year_end,
            dry_run,
        } => {
            commands::reset_failures::execute(
                &cli.config,
                &commands::reset_failures::ResetArgs {
                    all,
                    states,
                    schools,
                    year_start,
                    year_end,
                    dry_run,
                },
            )
            .await
        }
        Commands::Failures { record_key } => {
            commands::failures::execute(&cli.config, record_key.as_deref()).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
