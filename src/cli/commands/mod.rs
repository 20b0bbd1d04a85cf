//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod init;
mod run;
mod schedule;
mod status;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use pricewatch::config::load_config;

#[derive(Parser)]
#[command(name = "pricewatch")]
#[command(about = "Resumable daily product-page scraper")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape today's list once, resuming from the stored checkpoint
    Run {
        /// Start no earlier than this list position (0-based)
        #[arg(long)]
        from_idx: Option<usize>,
        /// Identifier file (overrides scrape.input)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run every day at a fixed local time
    Schedule {
        /// Daily start time as HH:MM (overrides schedule.at)
        #[arg(long)]
        at: Option<String>,
        /// Also run once immediately before waiting for the first slot
        #[arg(long)]
        now: bool,
    },

    /// Show checkpoint and stored row counts for a day
    Status {
        /// Day to inspect as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Create the data directory and apply database migrations
    Init,
}

/// Parse arguments, run the command and return the process exit code.
pub async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Run {
        from_idx: None,
        input: None,
    }) {
        Commands::Run { from_idx, input } => run::cmd_run(&config, from_idx, input).await,
        Commands::Schedule { at, now } => schedule::cmd_schedule(&config, at, now).await,
        Commands::Status { date } => status::cmd_status(&config, date).await.map(|_| 0),
        Commands::Init => init::cmd_init(&config).await.map(|_| 0),
    }
}
