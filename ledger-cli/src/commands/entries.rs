//! Entries command - show an account's journal

use anyhow::Result;

use super::{finish, get_context};
use crate::output;

pub fn run(account_id: &str, limit: usize, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let result = ctx.account_service.entries(account_id, limit);

    finish("entries", result, json, |entries| {
        if entries.is_empty() {
            println!("No entries found.");
            return;
        }

        let mut table = output::create_table();
        table.set_header(vec!["Time", "Amount", "Balance after", "Settlement"]);
        for entry in entries {
            table.add_row(vec![
                entry.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                entry.amount.to_string(),
                entry.balance_after.to_string(),
                entry.settlement_id.clone().unwrap_or_default(),
            ]);
        }
        println!("{}", table);
    })
}
