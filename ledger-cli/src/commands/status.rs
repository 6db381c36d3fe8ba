//! Status command - show ledger location, size and policy

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use super::{finish, get_context, get_ledger_dir, Subject};
use crate::output;

#[derive(Serialize)]
struct LedgerStatus {
    ledger_dir: String,
    database_path: Option<String>,
    database_size_bytes: u64,
    total_accounts: u64,
    allow_negative_balance: bool,
    lock_timeout_ms: u64,
    max_commit_attempts: u32,
}

impl Subject for LedgerStatus {}

pub fn run(json: bool) -> Result<()> {
    let ledger_dir = get_ledger_dir()?;
    let ctx = get_context()?;

    let db_path = ctx.store.db_path().map(|p| p.to_path_buf());
    let size_bytes = db_path
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    let result = ctx
        .account_service
        .count_accounts()
        .map(|total_accounts| LedgerStatus {
            ledger_dir: ledger_dir.display().to_string(),
            database_path: db_path.map(|p| p.display().to_string()),
            database_size_bytes: size_bytes,
            total_accounts,
            allow_negative_balance: ctx.config.allow_negative_balance,
            lock_timeout_ms: ctx.config.lock_timeout_ms,
            max_commit_attempts: ctx.config.max_commit_attempts,
        });

    finish("status", result, json, |status| {
        println!("{}", "Ledger Status".bold());
        println!();

        let mut table = output::create_table();
        table.add_row(vec!["Directory".to_string(), status.ledger_dir.clone()]);
        table.add_row(vec![
            "Database".to_string(),
            status.database_path.clone().unwrap_or_else(|| "(in memory)".to_string()),
        ]);
        table.add_row(vec!["Size".to_string(), output::format_size(status.database_size_bytes)]);
        table.add_row(vec!["Accounts".to_string(), status.total_accounts.to_string()]);
        table.add_row(vec![
            "Negative balances".to_string(),
            if status.allow_negative_balance { "allowed" } else { "rejected" }.to_string(),
        ]);
        table.add_row(vec!["Lock timeout".to_string(), format!("{} ms", status.lock_timeout_ms)]);
        table.add_row(vec![
            "Commit attempts".to_string(),
            status.max_commit_attempts.to_string(),
        ]);
        println!("{}", table);
    })
}
