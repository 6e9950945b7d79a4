//! TiltR CLI - Main Entry Point
//!
//! One binary for both roles: `tiltr master` runs a plan and serves the
//! machine pool, `tiltr machine` joins a pool and executes cases.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;

use commands::{machine, master, plan, status};

/// Exit status for aborted runs and infrastructure errors
const EXIT_ABORTED: u8 = 2;

/// TiltR - distributed end-to-end test runs over a Selenium grid
#[derive(Parser)]
#[command(name = "tiltr")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test plan and coordinate machines until it finishes
    Master(master::MasterArgs),

    /// Join a master's pool and execute assigned cases
    Machine(machine::MachineArgs),

    /// Validate a test plan
    Validate(plan::ValidateArgs),

    /// Query a running master
    Status(status::StatusArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
        });
    }

    let result = match cli.command {
        Commands::Master(args) => master::execute(args, cli.format, shutdown).await,
        Commands::Machine(args) => machine::execute(args, shutdown).await,
        Commands::Validate(args) => plan::execute(args),
        Commands::Status(args) => status::execute(args, cli.format).await,
    };

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(EXIT_ABORTED)),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(EXIT_ABORTED)
        }
    }
}
