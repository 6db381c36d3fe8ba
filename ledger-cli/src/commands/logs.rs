//! Logs command - inspect the event log kept next to the ledger

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use dialoguer::Confirm;
use serde::Serialize;

use super::get_ledger_dir;
use crate::output;
use ledger_core::services::logging::now_ms;
use ledger_core::{EntryPoint, LogEntry, LoggingService};

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Subcommand)]
pub enum LogsCommands {
    /// Show recent events, newest first
    List {
        /// Maximum number of events
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only events that touched this account id
        #[arg(long)]
        account: Option<String>,
        /// Only failed operations
        #[arg(long)]
        errors: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count failures by error kind
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop events older than a number of days
    Clear {
        /// Age in days; 0 drops everything
        #[arg(long, default_value = "30")]
        older_than_days: u32,
        /// Do not ask for confirmation
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Copy the event log database to a file
    Export {
        /// Destination path
        destination: PathBuf,
    },
}

#[derive(Serialize)]
struct LogStats {
    total: u64,
    failures: u64,
    by_kind: Vec<KindCount>,
    oldest: Option<String>,
    newest: Option<String>,
    path: String,
}

#[derive(Serialize)]
struct KindCount {
    kind: String,
    count: u64,
}

fn open_log() -> Result<LoggingService> {
    let ledger_dir = get_ledger_dir()?;
    std::fs::create_dir_all(&ledger_dir)
        .with_context(|| format!("Failed to create {}", ledger_dir.display()))?;
    LoggingService::new(&ledger_dir, EntryPoint::Cli, env!("CARGO_PKG_VERSION"))
}

fn when(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("@{}", timestamp_ms))
}

fn outcome(entry: &LogEntry) -> String {
    match (&entry.error_kind, &entry.error_message) {
        (_, None) => "ok".green().to_string(),
        (Some(kind), Some(msg)) => format!("{} ({})", msg, kind).red().to_string(),
        (None, Some(msg)) => msg.red().to_string(),
    }
}

fn list(
    log: &LoggingService,
    limit: usize,
    account: Option<&str>,
    errors: bool,
    json: bool,
) -> Result<()> {
    let entries = match account {
        Some(id) => log.get_for_account(id, errors, limit)?,
        None if errors => log.get_errors(limit)?,
        None => log.get_recent(limit)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        output::info("No matching events.");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["When (UTC)", "From", "Event", "Command", "Account", "Outcome"]);
    for entry in &entries {
        table.add_row(vec![
            when(entry.timestamp),
            entry.entry_point.clone(),
            entry.event.clone(),
            entry.command.clone().unwrap_or_default(),
            entry.account_id.clone().unwrap_or_default(),
            outcome(entry),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn stats(log: &LoggingService, json: bool) -> Result<()> {
    let by_kind: Vec<KindCount> = log
        .error_counts()?
        .into_iter()
        .map(|(kind, count)| KindCount { kind, count })
        .collect();
    let span = log.time_span()?;
    let stats = LogStats {
        total: log.count()?,
        failures: by_kind.iter().map(|k| k.count).sum(),
        by_kind,
        oldest: span.map(|(first, _)| when(first)),
        newest: span.map(|(_, last)| when(last)),
        path: log.db_path().display().to_string(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", "Event Log".bold());
    println!("  {} events, {} failed", stats.total, stats.failures);
    if let (Some(oldest), Some(newest)) = (&stats.oldest, &stats.newest) {
        println!("  Covering {} to {}", oldest, newest);
    }
    let size = std::fs::metadata(log.db_path()).map(|m| m.len()).unwrap_or(0);
    println!("  Stored in {} ({})", stats.path, output::format_size(size));

    if !stats.by_kind.is_empty() {
        let mut table = output::create_table();
        table.set_header(vec!["Error kind", "Count"]);
        for row in &stats.by_kind {
            table.add_row(vec![row.kind.clone(), row.count.to_string()]);
        }
        println!("{}", table);
    }
    Ok(())
}

fn clear(log: &LoggingService, older_than_days: u32, force: bool) -> Result<()> {
    let prompt = if older_than_days == 0 {
        "Drop every event in the log?".to_string()
    } else {
        format!("Drop events older than {} days?", older_than_days)
    };
    if !force && !Confirm::new().with_prompt(prompt).default(false).interact()? {
        output::warning("Nothing removed.");
        return Ok(());
    }

    // +1 so that "0 days" also takes events written this millisecond
    let cutoff = now_ms() + 1 - i64::from(older_than_days) * MS_PER_DAY;
    let removed = log.delete_before(cutoff)?;
    output::success(&format!("Removed {} events", removed));
    Ok(())
}

pub fn run(command: LogsCommands) -> Result<()> {
    let log = open_log()?;

    match command {
        LogsCommands::List { limit, account, errors, json } => {
            list(&log, limit, account.as_deref(), errors, json)
        }
        LogsCommands::Stats { json } => stats(&log, json),
        LogsCommands::Clear { older_than_days, force } => clear(&log, older_than_days, force),
        LogsCommands::Export { destination } => {
            let written = log.export(&destination)?;
            output::success(&format!("Event log copied to {}", written.display()));
            Ok(())
        }
    }
}
