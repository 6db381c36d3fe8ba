//! Adjust and settle commands - change an account balance

use std::time::{Duration, Instant};

use anyhow::Result;
use colored::Colorize;

use super::{finish, get_context, parse_amount};
use crate::output;
use ledger_core::SettlementOutcome;

/// Credit or debit an account
pub fn run(key: &str, amount: &str, timeout_ms: Option<u64>, json: bool) -> Result<()> {
    let amount = parse_amount(amount)?;
    let ctx = get_context()?;
    let service = &ctx.account_service;

    let result = match timeout_ms {
        Some(ms) => {
            let deadline = Instant::now() + Duration::from_millis(ms);
            service.adjust_balance_with_deadline(key, amount, deadline)
        }
        None => service.adjust_balance(key, amount),
    };

    finish("adjust", result, json, |account| {
        output::success(&format!("Balance adjusted by {}", amount));
        println!("  New balance: {}", account.balance.to_string().bold());
        println!("  Version: {}", account.version);
    })
}

/// Apply a settlement result once per settlement id
pub fn run_settle(key: &str, amount: &str, settlement_id: &str, json: bool) -> Result<()> {
    let amount = parse_amount(amount)?;
    let ctx = get_context()?;

    let result = ctx
        .account_service
        .apply_settlement(key, amount, settlement_id);

    finish("settle", result, json, |outcome| {
        match outcome {
            SettlementOutcome::Applied(_) => {
                output::success(&format!("Settlement {} applied", settlement_id))
            }
            SettlementOutcome::AlreadyApplied(_) => output::info(&format!(
                "Settlement {} was already applied; nothing changed",
                settlement_id
            )),
        }
        println!("  Balance: {}", outcome.snapshot().balance.to_string().bold());
    })
}
