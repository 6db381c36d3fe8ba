//! Config command - view and change settings.json

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use super::{get_ledger_dir, get_logger, log_event};
use crate::output;
use ledger_core::config::Config;
use ledger_core::LogEvent;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective settings (environment overrides applied)
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change settings stored in settings.json
    Set {
        /// Allow debits to take balances below zero
        #[arg(long)]
        allow_negative_balance: Option<bool>,
        /// How long a commit waits for a locked account
        #[arg(long)]
        lock_timeout_ms: Option<u64>,
        /// Commit attempts on write conflicts (1-50)
        #[arg(long)]
        max_commit_attempts: Option<u32>,
    },
}

fn settings_json(config: &Config) -> serde_json::Value {
    serde_json::json!({
        "databaseFile": config.database_file,
        "allowNegativeBalance": config.allow_negative_balance,
        "lockTimeoutMs": config.lock_timeout_ms,
        "maxCommitAttempts": config.max_commit_attempts,
    })
}

pub fn run(command: ConfigCommands) -> Result<()> {
    let ledger_dir = get_ledger_dir()?;

    match command {
        ConfigCommands::Show { json } => {
            let config = Config::load(&ledger_dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&settings_json(&config))?);
                return Ok(());
            }

            println!("{}", "Ledger Settings".bold());
            let mut table = output::create_table();
            for (key, value) in [
                ("Database file", config.database_file.clone()),
                ("Negative balances", config.allow_negative_balance.to_string()),
                ("Lock timeout (ms)", config.lock_timeout_ms.to_string()),
                ("Commit attempts", config.max_commit_attempts.to_string()),
            ] {
                table.add_row(vec![key.to_string(), value]);
            }
            println!("{}", table);
        }
        ConfigCommands::Set {
            allow_negative_balance,
            lock_timeout_ms,
            max_commit_attempts,
        } => {
            if allow_negative_balance.is_none()
                && lock_timeout_ms.is_none()
                && max_commit_attempts.is_none()
            {
                bail!("Nothing to change; pass at least one setting");
            }

            std::fs::create_dir_all(&ledger_dir)?;
            // Environment overrides must not leak into the saved file
            let mut config = Config::load_settings(&ledger_dir)?;
            if let Some(flag) = allow_negative_balance {
                config.allow_negative_balance = flag;
            }
            if let Some(ms) = lock_timeout_ms {
                config.lock_timeout_ms = ms;
            }
            if let Some(attempts) = max_commit_attempts {
                config.set_max_commit_attempts(attempts);
                if config.max_commit_attempts != attempts {
                    output::warning(&format!(
                        "Commit attempts clamped to {}",
                        config.max_commit_attempts
                    ));
                }
            }
            config.save(&ledger_dir)?;

            log_event(&get_logger(), LogEvent::new("config_changed").with_command("config set"));
            output::success("Settings saved");
        }
    }

    Ok(())
}
