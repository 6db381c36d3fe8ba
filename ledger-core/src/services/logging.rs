//! Logging service - structured event logging to DuckDB
//!
//! Records what the ledger front ends did (commands run, failures and their
//! error kind) in logs.duckdb, next to the ledger database. API keys,
//! balances and amounts are never written here; an account is referenced by
//! its id only.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use duckdb::{params, Connection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::result::{ErrorKind, LedgerError};
use crate::log_migrations::LOG_MIGRATIONS;
use crate::services::MigrationService;

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique ID based on timestamp + counter
fn generate_id() -> u64 {
    // Lower 16 bits: counter (65536 ids per millisecond)
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    ((now_ms() as u64) << 16) | counter
}

/// Current unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// Which front end produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    /// The `ledger` command line
    Cli,
    /// A long-running embedder (API handler, settlement consumer)
    Service,
}

impl EntryPoint {
    fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Cli => "cli",
            EntryPoint::Service => "service",
        }
    }
}

/// A log event to be recorded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Record a ledger failure: its kind and display message
    pub fn with_ledger_error(mut self, err: &LedgerError) -> Self {
        self.error_kind = Some(err.kind());
        self.error_message = Some(err.to_string());
        self
    }
}

/// A log entry as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub entry_point: String,
    pub app_version: String,
    pub platform: String,
    pub event: String,
    pub command: Option<String>,
    pub account_id: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

const ENTRY_COLUMNS: &str = "id, timestamp, entry_point, app_version, platform, \
     event, command, account_id, error_kind, error_message";

fn entry_from_row(row: &duckdb::Row) -> duckdb::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        entry_point: row.get(2)?,
        app_version: row.get(3)?,
        platform: row.get(4)?,
        event: row.get(5)?,
        command: row.get(6)?,
        account_id: row.get(7)?,
        error_kind: row.get(8)?,
        error_message: row.get(9)?,
    })
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::AlreadyExists => "already_exists",
        ErrorKind::Rejected => "rejected",
        ErrorKind::Transient => "transient",
        ErrorKind::Internal => "internal",
    }
}

/// Service for structured event logging
pub struct LoggingService {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    entry_point: EntryPoint,
    app_version: String,
    platform: &'static str,
}

impl LoggingService {
    /// Open or create logs.duckdb in the ledger directory and run any
    /// pending log migrations.
    pub fn new(
        ledger_dir: &Path,
        entry_point: EntryPoint,
        app_version: impl Into<String>,
    ) -> Result<Self> {
        let db_path = ledger_dir.join("logs.duckdb");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;

        MigrationService::with_migrations(&conn, LOG_MIGRATIONS).run_pending()?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            entry_point,
            app_version: app_version.into(),
            platform: detect_platform(),
        })
    }

    /// Record an event, stamped with entry point, version and platform
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO sys_logs (
                id, timestamp, entry_point, app_version, platform,
                event, command, account_id, error_kind, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                generate_id(),
                now_ms(),
                self.entry_point.as_str(),
                &self.app_version,
                self.platform,
                &event.event,
                &event.command,
                &event.account_id,
                event.error_kind.map(kind_label),
                &event.error_message,
            ],
        )?;

        Ok(())
    }

    pub fn log_event(&self, event: &str) -> Result<()> {
        self.log(LogEvent::new(event))
    }

    /// Log a CLI command execution
    pub fn log_command(&self, command: &str) -> Result<()> {
        self.log(LogEvent::new("command_executed").with_command(command))
    }

    pub fn log_error(&self, event: &str, message: &str) -> Result<()> {
        self.log(LogEvent::new(event).with_error(message))
    }

    /// Most recent entries first
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query(
            &format!(
                "SELECT {} FROM sys_logs ORDER BY id DESC LIMIT ?",
                ENTRY_COLUMNS
            ),
            [limit as i64],
        )
    }

    /// Most recent failures first
    pub fn get_errors(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query(
            &format!(
                "SELECT {} FROM sys_logs WHERE error_message IS NOT NULL ORDER BY id DESC LIMIT ?",
                ENTRY_COLUMNS
            ),
            [limit as i64],
        )
    }

    /// Entries that mention `account_id`, newest first
    pub fn get_for_account(
        &self,
        account_id: &str,
        errors_only: bool,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let filter = if errors_only {
            " AND error_message IS NOT NULL"
        } else {
            ""
        };
        self.query(
            &format!(
                "SELECT {} FROM sys_logs WHERE account_id = ?{} ORDER BY id DESC LIMIT ?",
                ENTRY_COLUMNS, filter
            ),
            params![account_id, limit as i64],
        )
    }

    /// Failure counts per error kind, most frequent first.
    /// Failures recorded without a kind are grouped as `unclassified`.
    pub fn error_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(error_kind, 'unclassified') AS kind, COUNT(*) AS n
             FROM sys_logs
             WHERE error_message IS NOT NULL
             GROUP BY kind
             ORDER BY n DESC, kind",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Oldest and newest entry timestamps (ms), if any entries exist
    pub fn time_span(&self) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let span: (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM sys_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(span.0.zip(span.1))
    }

    fn query(&self, sql: &str, args: impl duckdb::Params) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let entries = stmt
            .query_map(args, entry_from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete logs older than the given unix timestamp (ms)
    pub fn delete_before(&self, timestamp_ms: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?", [timestamp_ms])?;
        Ok(deleted as u64)
    }

    /// Copy the log database to `output_path` for troubleshooting
    pub fn export(&self, output_path: &Path) -> Result<PathBuf> {
        let conn = self.conn.lock();

        // Flush the WAL so the copy is complete
        conn.execute_batch("CHECKPOINT")?;
        std::fs::copy(&self.db_path, output_path)
            .with_context(|| format!("Failed to copy logs to {}", output_path.display()))?;

        Ok(output_path.to_path_buf())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
