//! Output formatting utilities

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table, ContentArrangement};
use ledger_core::AccountSnapshot;

/// Print a success message
pub fn success(msg: &str) {
    println!("{}", msg.green());
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{}", msg.yellow());
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{}", msg.cyan());
}

/// Create a styled table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Key/value table for one account
pub fn account_table(account: &AccountSnapshot, show_key: bool) -> Table {
    let mut table = create_table();
    table.add_row(vec!["ID", account.id.as_str()]);
    table.add_row(vec!["Name", account.name.as_str()]);
    table.add_row(vec!["Email", account.email.as_str()]);
    table.add_row(vec!["Balance".to_string(), account.balance.to_string()]);
    if show_key {
        table.add_row(vec!["API key", account.api_key.as_str()]);
    }
    table.add_row(vec!["Version".to_string(), account.version.to_string()]);
    table.add_row(vec!["Created".to_string(), account.created_at.to_rfc3339()]);
    table.add_row(vec!["Updated".to_string(), account.updated_at.to_rfc3339()]);
    table
}

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
