//! CLI command implementations

pub mod account;
pub mod adjust;
pub mod config;
pub mod entries;
pub mod logs;
pub mod status;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;

use ledger_core::{
    AccountSnapshot, EntryPoint, LedgerContext, LedgerEntry, LedgerError, LogEvent, LoggingService,
    OperationResult, SettlementOutcome,
};

/// Get the logging service for CLI operations
///
/// Returns None if logging fails to initialize (shouldn't block operations)
pub fn get_logger() -> Option<LoggingService> {
    let ledger_dir = get_ledger_dir().ok()?;
    std::fs::create_dir_all(&ledger_dir).ok()?;
    LoggingService::new(&ledger_dir, EntryPoint::Cli, env!("CARGO_PKG_VERSION")).ok()
}

/// Log an event, ignoring any errors (logging should never break the app)
pub fn log_event(logger: &Option<LoggingService>, event: LogEvent) {
    if let Some(l) = logger {
        if let Err(e) = l.log(event) {
            tracing::debug!(error = %e, "event log write failed");
        }
    }
}

/// Get the ledger directory from environment or default
pub fn get_ledger_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("LEDGER_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".ledger"))
        .ok_or_else(|| anyhow!("Could not find home directory; set LEDGER_DIR"))
}

/// Open the ledger context
pub fn get_context() -> Result<LedgerContext> {
    let ledger_dir = get_ledger_dir()?;
    LedgerContext::new(&ledger_dir).context("Failed to initialize ledger context")
}

/// Parse an amount exactly as typed; no silent rounding
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    Decimal::from_str_exact(raw.trim()).map_err(|_| anyhow!("Invalid amount: {}", raw))
}

/// Account a command result is about, recorded in the event log by id
pub trait Subject {
    fn account_id(&self) -> Option<&str> {
        None
    }
}

impl Subject for AccountSnapshot {
    fn account_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

impl Subject for SettlementOutcome {
    fn account_id(&self) -> Option<&str> {
        Some(&self.snapshot().id)
    }
}

impl Subject for Vec<LedgerEntry> {
    fn account_id(&self) -> Option<&str> {
        self.first().map(|entry| entry.account_id.as_str())
    }
}

/// Record the outcome of a ledger call in the event log and print it.
///
/// In JSON mode the result is wrapped in an `OperationResult`; otherwise
/// `render` prints the success value. Failures become the command's error.
pub fn finish<T: Serialize + Subject>(
    command: &str,
    result: ledger_core::domain::result::Result<T>,
    json: bool,
    render: impl FnOnce(&T),
) -> Result<()> {
    let logger = get_logger();
    match &result {
        Ok(value) => {
            let mut event = LogEvent::new("command_executed").with_command(command);
            if let Some(id) = value.account_id() {
                event = event.with_account(id);
            }
            log_event(&logger, event)
        }
        Err(e) => log_event(
            &logger,
            LogEvent::new("command_failed")
                .with_command(command)
                .with_ledger_error(e),
        ),
    }

    if json {
        let failure = result.as_ref().err().map(LedgerError::to_string);
        let wrapped: OperationResult<T> = result.into();
        println!("{}", serde_json::to_string_pretty(&wrapped)?);
        return match failure {
            Some(msg) => Err(anyhow!(msg)),
            None => Ok(()),
        };
    }

    let value = result?;
    render(&value);
    Ok(())
}
