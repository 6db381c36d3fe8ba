//! Ledger CLI - operate a payment-gateway account ledger from the terminal

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{account, adjust, config, entries, logs, status};

/// Ledger - account balances for a payment gateway
#[derive(Parser)]
#[command(name = "ledger", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and inspect accounts
    Account {
        #[command(subcommand)]
        command: account::AccountCommands,
    },

    /// Credit (positive) or debit (negative) an account
    Adjust {
        /// Amount, e.g. 50 or -20.25
        #[arg(allow_hyphen_values = true)]
        amount: String,
        /// API key of the account
        #[arg(long, env = "LEDGER_API_KEY")]
        key: String,
        /// Give up if the account stays locked this long
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply a settlement result (at most once per settlement id)
    Settle {
        /// Amount, e.g. 99.99 or -5
        #[arg(allow_hyphen_values = true)]
        amount: String,
        /// API key of the account
        #[arg(long, env = "LEDGER_API_KEY")]
        key: String,
        /// Upstream settlement identifier
        #[arg(long)]
        settlement_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an account's journal, newest first
    Entries {
        /// Account ID
        account_id: String,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show ledger location, size and policy
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// View and change ledger settings
    Config {
        #[command(subcommand)]
        command: config::ConfigCommands,
    },

    /// View and manage the event log
    Logs {
        #[command(subcommand)]
        command: logs::LogsCommands,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LEDGER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Account { command } => account::run(command),
        Commands::Adjust { amount, key, timeout_ms, json } => {
            adjust::run(&key, &amount, timeout_ms, json)
        }
        Commands::Settle { amount, key, settlement_id, json } => {
            adjust::run_settle(&key, &amount, &settlement_id, json)
        }
        Commands::Entries { account_id, limit, json } => entries::run(&account_id, limit, json),
        Commands::Status { json } => status::run(json),
        Commands::Config { command } => config::run(command),
        Commands::Logs { command } => logs::run(command),
    }
}
