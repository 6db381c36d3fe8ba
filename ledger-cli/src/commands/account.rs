//! Account command - create and inspect accounts

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use dialoguer::Input;

use super::{finish, get_context};
use crate::output;

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create an account with a zero balance
    New {
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Contact email
        #[arg(long)]
        email: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show an account by API key or id
    Show {
        /// API key of the account
        #[arg(long, env = "LEDGER_API_KEY", conflicts_with = "id")]
        key: Option<String>,
        /// Account ID
        #[arg(long)]
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: AccountCommands) -> Result<()> {
    match command {
        AccountCommands::New { name, email, json } => run_new(name, email, json),
        AccountCommands::Show { key, id, json } => run_show(key, id, json),
    }
}

fn run_new(name: Option<String>, email: Option<String>, json: bool) -> Result<()> {
    let ctx = get_context()?;

    // Prompt for whatever was not given on the command line
    let name = match name {
        Some(n) => n,
        None => Input::new().with_prompt("Name").interact_text()?,
    };
    let email = match email {
        Some(e) => e,
        None => Input::new().with_prompt("Email").interact_text()?,
    };

    let result = ctx.account_service.create_account(&name, &email);
    finish("account new", result, json, |account| {
        output::success("Account created");
        println!("{}", output::account_table(account, true));
        output::warning("Store the API key now; it is the account's only credential.");
    })
}

fn run_show(key: Option<String>, id: Option<String>, json: bool) -> Result<()> {
    let ctx = get_context()?;

    let result = match (key, id) {
        (Some(key), _) => ctx.account_service.find_by_api_key(&key),
        (None, Some(id)) => ctx.account_service.find_by_id(&id),
        (None, None) => bail!("Pass --key or --id"),
    };

    finish("account show", result, json, |account| {
        println!("{}", account.name.bold());
        println!("{}", output::account_table(account, false));
    })
}
