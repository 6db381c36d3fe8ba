//! Ledger Core - account balances for a payment gateway
//!
//! This crate implements the core domain logic following hexagonal architecture:
//!
//! - **domain**: the Account aggregate, journal entries, error types
//! - **ports**: the AccountStore trait the service depends on
//! - **services**: AccountService (the only way balances change), migrations, event log
//! - **adapters**: DuckDB implementation of AccountStore with per-row locking

pub mod domain;
pub mod ports;
pub mod services;
pub mod adapters;
pub mod config;
pub mod migrations;
pub mod log_migrations;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use adapters::duckdb::DuckDbAccountStore;
use config::Config;

// Re-export commonly used types at crate root
pub use domain::{Account, AccountSnapshot, LedgerEntry};
pub use domain::result::{ErrorKind, LedgerError, OperationResult};
pub use services::{
    AccountService, EntryPoint, LedgerPolicy, LogEntry, LogEvent, LoggingService,
    SettlementOutcome,
};

/// Main context for ledger operations
///
/// Holds the configuration, the store (schema ensured) and the account
/// service wired on top of it.
pub struct LedgerContext {
    pub config: Config,
    pub store: Arc<DuckDbAccountStore>,
    pub account_service: AccountService,
}

impl LedgerContext {
    /// Open the ledger kept in `ledger_dir`, creating it if needed
    pub fn new(ledger_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(ledger_dir)
            .with_context(|| format!("Failed to create {}", ledger_dir.display()))?;

        let config = Config::load(ledger_dir)?;
        let db_path = ledger_dir.join(&config.database_file);
        let store = DuckDbAccountStore::open(&db_path, config.store_options())
            .with_context(|| format!("Failed to open ledger at {}", db_path.display()))?;

        Self::with_store(config, store)
    }

    /// Ledger backed by a private in-memory database
    pub fn in_memory(config: Config) -> Result<Self> {
        let store = DuckDbAccountStore::open_in_memory(config.store_options())?;
        Self::with_store(config, store)
    }

    fn with_store(config: Config, store: DuckDbAccountStore) -> Result<Self> {
        store.ensure_schema()?;

        let store = Arc::new(store);
        let account_service = AccountService::new(store.clone(), config.policy());

        Ok(Self {
            config,
            store,
            account_service,
        })
    }
}
