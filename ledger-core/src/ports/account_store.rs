//! Account store port - persistence abstraction for the ledger

use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Account, LedgerEntry};

/// Balances are stored as DECIMAL(18, 4); magnitudes at or above this do not fit.
pub const BALANCE_LIMIT: Decimal = Decimal::from_parts(276_447_232, 23_283, 0, false, 0);

/// Failures reported by an [`AccountStore`]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate value for unique field `{field}`")]
    DuplicateKey { field: &'static str },

    #[error("concurrent write conflict: {0}")]
    Conflict(String),

    #[error("timed out waiting for row lock")]
    LockTimeout,

    #[error("balance would fall below {floor}")]
    InsufficientFunds { floor: Decimal },

    #[error("balance would reach the storable limit of {limit}")]
    CapacityExceeded { limit: Decimal },

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Whether repeating the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::LockTimeout | Self::Unavailable(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Knobs for a single balance commit
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Bounds both the row-lock wait and the transaction. Falls back to the
    /// store's lock timeout when unset.
    pub deadline: Option<Instant>,
    /// Debits may not take the balance below this value
    pub floor: Option<Decimal>,
    /// Apply at most once per settlement id
    pub settlement_id: Option<String>,
}

impl CommitOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_floor(mut self, floor: Decimal) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn with_settlement_id(mut self, settlement_id: impl Into<String>) -> Self {
        self.settlement_id = Some(settlement_id.into());
        self
    }
}

/// Persisted state after a commit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommittedBalance {
    pub balance: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    /// False when the settlement id had already been applied and nothing was written
    pub applied: bool,
}

/// Durable account storage.
///
/// `commit_balance` is the only write path for balances: it re-reads the
/// row under an exclusive lock, adds the aggregate's pending delta and writes
/// the result in one transaction. Implementations must roll back every
/// failed transaction before returning the error.
pub trait AccountStore: Send + Sync {
    /// Insert a new account
    fn save(&self, account: &Account) -> StoreResult<()>;

    fn find_by_api_key(&self, api_key: &str) -> StoreResult<Account>;

    fn find_by_id(&self, id: &str) -> StoreResult<Account>;

    /// Persist the pending delta of `account` under a row lock
    fn commit_balance(
        &self,
        account: &Account,
        options: &CommitOptions,
    ) -> StoreResult<CommittedBalance>;

    /// Most recent journal entries for an account, newest first
    fn list_entries(&self, account_id: &str, limit: usize) -> StoreResult<Vec<LedgerEntry>>;

    fn count_accounts(&self) -> StoreResult<u64>;
}
