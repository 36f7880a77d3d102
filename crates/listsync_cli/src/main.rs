//! listsync CLI
//!
//! Operator tools for the listsync pipeline.
//!
//! # Commands
//!
//! - `simulate` - Run the coordinator, queue, workers and auditor against
//!   in-memory stores with injected faults, then report
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// listsync command-line tools.
#[derive(Parser)]
#[command(name = "listsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate the sync pipeline against faulty in-memory stores
    Simulate {
        /// Number of listings to create
        #[arg(short, long, default_value = "100")]
        listings: usize,

        /// Lose the index change of every Nth listing (0 disables)
        #[arg(long, default_value = "10")]
        lose_every: usize,

        /// Fail the first N index writes
        #[arg(long, default_value = "3")]
        fail_first: usize,

        /// Number of sync workers
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Skip the repair pass after the first audit
        #[arg(long)]
        no_repair: bool,

        /// Seconds to wait for the queue to drain
        #[arg(long, default_value = "10")]
        drain_timeout: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            listings,
            lose_every,
            fail_first,
            workers,
            no_repair,
            drain_timeout,
            format,
        } => {
            let options = commands::simulate::Options {
                listings,
                lose_every,
                fail_first,
                workers,
                repair: !no_repair,
                drain_timeout: Duration::from_secs(drain_timeout),
            };
            commands::simulate::run(&options, &format).await?;
        }
        Commands::Version => {
            println!("listsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("listsync core v{}", listsync_core::VERSION);
        }
    }

    Ok(())
}
