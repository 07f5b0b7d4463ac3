//! Warden CLI
//!
//! Operator tool for inspecting supervised workers, forcing recovery actions
//! and reviewing learned strategies through the wardend API.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{strategies, workers};
use std::process::ExitCode;
use warden_lib::{FailureSignature, RecoveryAction};

/// Warden worker supervisor CLI
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "CLI for the Warden worker supervisor", long_about = None)]
pub struct Cli {
    /// Daemon API URL (can also be set via WARDEN_API_URL env var)
    #[arg(long, env = "WARDEN_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show runtime state of all workers
    Status,

    /// Run a recovery action against a worker now
    Recover {
        /// Worker ID
        worker_id: String,

        /// Action to run (restart, graceful_restart, connection_reset, memory_cleanup, scale_up)
        #[arg(long, short)]
        action: RecoveryAction,
    },

    /// Show learned strategy statistics
    Strategies {
        /// Only show stats for this failure signature
        #[arg(long, short)]
        signature: Option<FailureSignature>,
    },

    /// Clear a worker's recovery state, including escalation
    Reset {
        /// Worker ID
        worker_id: String,
    },
}

async fn run(cli: Cli) -> Result<bool> {
    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Status => workers::show_status(&client, cli.format).await?,
        Commands::Recover { worker_id, action } => {
            return workers::recover(&client, &worker_id, action, cli.format).await;
        }
        Commands::Strategies { signature } => {
            strategies::show_strategies(&client, signature, cli.format).await?
        }
        Commands::Reset { worker_id } => workers::reset(&client, &worker_id, cli.format).await?,
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(2)
        }
    }
}
