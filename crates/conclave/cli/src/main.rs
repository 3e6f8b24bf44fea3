//! Conclave CLI - operator tooling for a ledger data directory
//!
//! - Re-verify the chain and the ceremony audit log
//! - Inspect the head, replay events, show halt and ceremony status
//! - Generate writer signing keys

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conclave_kernel::{init_tracing, BoundaryHandler, KernelConfig};
use conclave_types::ErrorClass;

mod commands;
mod output;

use output::OutputFormat;

/// Conclave CLI application
#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Conclave - constitutional ledger operator tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONCLAVE_CONFIG")]
    config: Option<String>,

    /// Data directory (overrides the configuration file)
    #[arg(short, long, env = "CONCLAVE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Re-verify signatures and hash links, and the ceremony audit log
    Verify {
        /// First sequence to report on
        #[arg(long, default_value = "1")]
        from: u64,

        /// Last sequence to report on (default: head)
        #[arg(long)]
        to: Option<u64>,
    },

    /// Show the ledger head
    Head,

    /// Print events in order
    Replay {
        /// First sequence to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Maximum number of events
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Show halt state, keys and active ceremonies
    Status,

    /// Generate a signing key and print its trust-anchor entry
    Keygen {
        /// Key id, e.g. writer-2
        #[arg(long)]
        key_id: String,

        /// Key directory (default: from configuration)
        #[arg(long)]
        key_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = KernelConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    // Initialize tracing
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    init_tracing(&logging)?;

    let boundary = BoundaryHandler::new(config.escalation_contact.clone());
    if let Err(e) = commands::execute(cli.command, &config, cli.output).await {
        let notice = boundary.handle(&e);
        output::print_notice(&notice, cli.output);
        std::process::exit(exit_code(notice.class));
    }
    Ok(())
}

fn exit_code(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Integrity => 2,
        ErrorClass::Halted => 3,
        ErrorClass::Liveness => 4,
        ErrorClass::Coordination | ErrorClass::Operational => 1,
    }
}
