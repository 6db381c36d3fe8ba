//! DuckDB account store implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use super::row_lock::RowLocks;
use crate::domain::account::{advance_timestamp, format_timestamp};
use crate::domain::{Account, LedgerEntry};
use crate::ports::{
    AccountStore, CommitOptions, CommittedBalance, StoreError, StoreResult, BALANCE_LIMIT,
};
use crate::services::MigrationService;

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Default bound on a row-lock wait when the caller gives no deadline
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT_COLUMNS: &str =
    "id, name, email, api_key, balance::VARCHAR, version, created_at, updated_at";

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("could not set lock on file")
        || lower.contains("file is already open")
}

impl From<duckdb::Error> for StoreError {
    fn from(err: duckdb::Error) -> Self {
        if let duckdb::Error::QueryReturnedNoRows = err {
            return StoreError::NotFound;
        }

        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("conflict") {
            StoreError::Conflict(msg)
        } else if lower.contains("duplicate key") || lower.contains("unique constraint") {
            // The message embeds the offending value; keep only the column
            let field = if lower.contains("api_key") {
                "api_key"
            } else if lower.contains("settlement_id") {
                "settlement_id"
            } else {
                "id"
            };
            StoreError::DuplicateKey { field }
        } else if is_retryable_error(&msg) {
            StoreError::Unavailable(msg)
        } else {
            StoreError::Database(msg)
        }
    }
}

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Raw account columns, converted outside the duckdb row callback
struct AccountRow {
    id: String,
    name: String,
    email: String,
    api_key: String,
    balance: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl AccountRow {
    fn from_row(row: &duckdb::Row) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            api_key: row.get(3)?,
            balance: row.get(4)?,
            version: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_account(self) -> StoreResult<Account> {
        Ok(Account::restore(
            self.id,
            self.name,
            self.email,
            self.api_key,
            parse_decimal(&self.balance)?,
            self.version,
            parse_timestamp(&self.created_at)?,
            parse_timestamp(&self.updated_at)?,
        ))
    }
}

/// DuckDB-backed [`AccountStore`]
///
/// Each handle owns one connection. Handles created with [`replica`] attach
/// to the same database and share the row-lock table, standing in for
/// several service instances in front of one database.
///
/// [`replica`]: DuckDbAccountStore::replica
pub struct DuckDbAccountStore {
    conn: Mutex<Connection>,
    row_locks: Arc<RowLocks>,
    db_path: Option<PathBuf>,
    options: StoreOptions,
}

impl DuckDbAccountStore {
    /// Open (or create) a database file.
    ///
    /// Retries with exponential backoff when the file is locked by another
    /// process.
    pub fn open(db_path: &Path, options: StoreOptions) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self::from_connection(
                        conn,
                        Arc::new(RowLocks::new()),
                        Some(db_path.to_path_buf()),
                        options,
                    ));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            attempt = attempt + 1,
                            max = MAX_RETRIES,
                            error = %err_msg,
                            "database busy, retrying"
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("Failed to open database after {} retries", MAX_RETRIES)))
    }

    /// Open a private in-memory database (tests, demos)
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let conn = Connection::open_in_memory_with_flags(config)?;
        Ok(Self::from_connection(
            conn,
            Arc::new(RowLocks::new()),
            None,
            options,
        ))
    }

    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // Extension autoloading stays off: the ledger needs none
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Connection::open_with_flags(db_path, config)?)
    }

    fn from_connection(
        conn: Connection,
        row_locks: Arc<RowLocks>,
        db_path: Option<PathBuf>,
        options: StoreOptions,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            row_locks,
            db_path,
            options,
        }
    }

    /// Another handle on the same database sharing this handle's row locks
    pub fn replica(&self) -> Result<Self> {
        let conn = self.conn.lock().try_clone()?;
        Ok(Self::from_connection(
            conn,
            Arc::clone(&self.row_locks),
            self.db_path.clone(),
            self.options.clone(),
        ))
    }

    /// Another handle on the same database with its own row-lock table.
    ///
    /// Behaves like a separate process: only DuckDB's write-conflict
    /// detection stands between it and other handles.
    pub fn detached_replica(&self) -> Result<Self> {
        let conn = self.conn.lock().try_clone()?;
        Ok(Self::from_connection(
            conn,
            Arc::new(RowLocks::new()),
            self.db_path.clone(),
            self.options.clone(),
        ))
    }

    /// Ensure database schema exists (runs pending migrations)
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let result = MigrationService::new(&conn).run_pending()?;
        if !result.applied.is_empty() {
            debug!(applied = ?result.applied, "ledger schema migrated");
        }
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn row_locks(&self) -> &RowLocks {
        &self.row_locks
    }

    fn find_one(&self, column: &str, value: &str) -> StoreResult<Account> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM accounts WHERE {} = ?",
            ACCOUNT_COLUMNS, column
        );
        let row = conn.query_row(&sql, params![value], AccountRow::from_row)?;
        row.into_account()
    }
}

impl AccountStore for DuckDbAccountStore {
    fn save(&self, account: &Account) -> StoreResult<()> {
        let conn = self.conn.lock();
        let snapshot = account.snapshot();
        conn.execute(
            "INSERT INTO accounts (id, name, email, api_key, balance, version, created_at, updated_at)
             VALUES (?, ?, ?, ?, CAST(? AS DECIMAL(18, 4)), ?, ?, ?)",
            params![
                snapshot.id,
                snapshot.name,
                snapshot.email,
                snapshot.api_key,
                snapshot.balance.to_string(),
                snapshot.version,
                format_timestamp(snapshot.created_at),
                format_timestamp(snapshot.updated_at),
            ],
        )?;
        debug!(account_id = %snapshot.id, "account row inserted");
        Ok(())
    }

    fn find_by_api_key(&self, api_key: &str) -> StoreResult<Account> {
        self.find_one("api_key", api_key)
    }

    fn find_by_id(&self, id: &str) -> StoreResult<Account> {
        self.find_one("id", id)
    }

    fn commit_balance(
        &self,
        account: &Account,
        options: &CommitOptions,
    ) -> StoreResult<CommittedBalance> {
        let deadline = options
            .deadline
            .unwrap_or_else(|| Instant::now() + self.options.lock_timeout);

        // Lock order: row, then connection
        let _row = self
            .row_locks
            .acquire(&account.id, deadline)
            .ok_or(StoreError::LockTimeout)?;
        let mut conn = self
            .conn
            .try_lock_until(deadline)
            .ok_or(StoreError::LockTimeout)?;

        // Dropping `tx` without commit rolls back
        let tx = conn.transaction()?;

        let (balance, version, updated_at): (String, i64, String) = tx.query_row(
            "SELECT balance::VARCHAR, version, updated_at FROM accounts WHERE id = ?",
            params![account.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let current = parse_decimal(&balance)?;
        let last_updated = parse_timestamp(&updated_at)?;

        if let Some(settlement_id) = &options.settlement_id {
            let seen: i64 = tx.query_row(
                "SELECT COUNT(*) FROM ledger_entries WHERE settlement_id = ?",
                params![settlement_id],
                |row| row.get(0),
            )?;
            if seen > 0 {
                debug!(account_id = %account.id, "settlement already applied");
                return Ok(CommittedBalance {
                    balance: current,
                    version,
                    updated_at: last_updated,
                    applied: false,
                });
            }
        }

        let delta = account.pending_delta().normalize();
        let new_balance = (current + delta).normalize();
        if let Some(floor) = options.floor {
            if delta < Decimal::ZERO && new_balance < floor {
                return Err(StoreError::InsufficientFunds { floor });
            }
        }
        if new_balance.abs() >= BALANCE_LIMIT {
            return Err(StoreError::CapacityExceeded { limit: BALANCE_LIMIT });
        }

        let now = advance_timestamp(last_updated);
        let stamp = format_timestamp(now);
        let changed = tx.execute(
            "UPDATE accounts
             SET balance = CAST(? AS DECIMAL(18, 4)), version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
            params![new_balance.to_string(), stamp, account.id, version],
        )?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!(
                "account {} changed underneath the transaction",
                account.id
            )));
        }

        tx.execute(
            "INSERT INTO ledger_entries (entry_id, account_id, amount, balance_after, settlement_id, created_at)
             VALUES (?, ?, CAST(? AS DECIMAL(18, 4)), CAST(? AS DECIMAL(18, 4)), ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                account.id,
                delta.to_string(),
                new_balance.to_string(),
                options.settlement_id,
                stamp,
            ],
        )
        .map_err(settlement_race)?;

        if Instant::now() > deadline {
            return Err(StoreError::LockTimeout);
        }

        tx.commit().map_err(settlement_race)?;
        debug!(account_id = %account.id, version = version + 1, "balance committed");

        Ok(CommittedBalance {
            balance: new_balance,
            version: version + 1,
            updated_at: now,
            applied: true,
        })
    }

    fn list_entries(&self, account_id: &str, limit: usize) -> StoreResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entry_id, account_id, amount::VARCHAR, balance_after::VARCHAR, settlement_id, created_at
             FROM ledger_entries
             WHERE account_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )?;

        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(entry_id, account_id, amount, balance_after, settlement_id, created_at)| {
                    Ok(LedgerEntry {
                        entry_id,
                        account_id,
                        amount: parse_decimal(&amount)?,
                        balance_after: parse_decimal(&balance_after)?,
                        settlement_id,
                        created_at: parse_timestamp(&created_at)?,
                    })
                },
            )
            .collect()
    }

    fn count_accounts(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// Helper functions

/// A unique violation on the journal means another handle recorded the same
/// settlement first; retrying will observe it.
fn settlement_race(err: duckdb::Error) -> StoreError {
    match StoreError::from(err) {
        StoreError::DuplicateKey { .. } => {
            StoreError::Conflict("settlement recorded concurrently".to_string())
        }
        other => other,
    }
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::database(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_decimal(s: &str) -> StoreResult<Decimal> {
    Decimal::from_str_exact(s.trim())
        .map(|d| d.normalize())
        .map_err(|e| StoreError::database(format!("bad decimal {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ApiKeyGenerator;

    struct FixedKey(&'static str);

    impl ApiKeyGenerator for FixedKey {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    fn test_store() -> DuckDbAccountStore {
        let store = DuckDbAccountStore::open_in_memory(StoreOptions::default()).unwrap();
        store.ensure_schema().unwrap();
        store
    }

    fn persisted(store: &DuckDbAccountStore) -> Account {
        let account = Account::new("Alice", "a@x.com");
        store.save(&account).unwrap();
        account
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_save_and_find() {
        let store = test_store();
        let account = persisted(&store);

        let by_id = store.find_by_id(&account.id).unwrap();
        let by_key = store.find_by_api_key(&account.api_key).unwrap();

        assert_eq!(by_id.snapshot(), account.snapshot());
        assert_eq!(by_key.snapshot(), account.snapshot());
        assert_eq!(store.count_accounts().unwrap(), 1);
    }

    #[test]
    fn test_find_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(store.find_by_id("nope"), Err(StoreError::NotFound)));
        assert!(matches!(
            store.find_by_api_key("nope"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_unique_api_key_constraint() {
        let store = test_store();
        let first = Account::with_key_generator("A", "a@x.com", &FixedKey("same"));
        let second = Account::with_key_generator("B", "b@x.com", &FixedKey("same"));

        store.save(&first).unwrap();
        let err = store.save(&second).unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey { field: "api_key" }));
        assert_eq!(store.count_accounts().unwrap(), 1);
    }

    #[test]
    fn test_commit_applies_pending_delta_to_locked_value() {
        let store = test_store();
        let account = persisted(&store);

        // Two stale copies loaded before either commit
        let first = store.find_by_id(&account.id).unwrap();
        let second = store.find_by_id(&account.id).unwrap();
        first.add_balance(dec("10"));
        second.add_balance(dec("15.5"));

        store.commit_balance(&first, &CommitOptions::default()).unwrap();
        let committed = store
            .commit_balance(&second, &CommitOptions::default())
            .unwrap();

        assert_eq!(committed.balance, dec("25.5"));
        assert_eq!(committed.version, 2);
        assert!(committed.applied);
        assert_eq!(store.find_by_id(&account.id).unwrap().balance(), dec("25.5"));
    }

    #[test]
    fn test_commit_unknown_account_is_not_found() {
        let store = test_store();
        let ghost = Account::new("Ghost", "g@x.com");
        ghost.add_balance(Decimal::ONE);

        let err = store
            .commit_balance(&ghost, &CommitOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_commit_advances_updated_at() {
        let store = test_store();
        let account = persisted(&store);
        account.add_balance(Decimal::ONE);

        let committed = store
            .commit_balance(&account, &CommitOptions::default())
            .unwrap();

        assert!(committed.updated_at > account.created_at);
        let reloaded = store.find_by_id(&account.id).unwrap();
        assert_eq!(reloaded.updated_at(), committed.updated_at);
        assert_eq!(reloaded.version(), 1);
    }

    #[test]
    fn test_failed_commit_after_lock_rolls_back() {
        let store = test_store();
        let account = persisted(&store);
        account.add_balance(dec("50"));
        store
            .commit_balance(&account, &CommitOptions::default())
            .unwrap();

        // Break the journal so the transaction fails after the UPDATE
        store
            .conn
            .lock()
            .execute_batch("DROP TABLE ledger_entries")
            .unwrap();

        let stale = store.find_by_id(&account.id).unwrap();
        stale.add_balance(dec("25"));
        let err = store
            .commit_balance(&stale, &CommitOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        let reloaded = store.find_by_id(&account.id).unwrap();
        assert_eq!(reloaded.balance(), dec("50"));
        assert_eq!(reloaded.version(), 1);
        assert!(!store.row_locks().is_locked(&account.id));
    }

    #[test]
    fn test_floor_rejects_overdraft_without_writing() {
        let store = test_store();
        let account = persisted(&store);
        account.add_balance(dec("-0.01"));

        let err = store
            .commit_balance(&account, &CommitOptions::default().with_floor(Decimal::ZERO))
            .unwrap_err();

        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
        assert_eq!(store.find_by_id(&account.id).unwrap().balance(), Decimal::ZERO);
        assert!(store.list_entries(&account.id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_balance_beyond_column_capacity_is_rejected() {
        let store = test_store();
        let account = persisted(&store);
        account.add_balance(dec("99999999999999.9999"));
        store
            .commit_balance(&account, &CommitOptions::default())
            .unwrap();

        let over = store.find_by_id(&account.id).unwrap();
        over.add_balance(dec("0.0001"));
        let err = store
            .commit_balance(&over, &CommitOptions::default())
            .unwrap_err();

        assert!(matches!(err, StoreError::CapacityExceeded { limit } if limit == BALANCE_LIMIT));
        assert!(!err.is_retryable());
        let reloaded = store.find_by_id(&account.id).unwrap();
        assert_eq!(reloaded.balance(), dec("99999999999999.9999"));
        assert_eq!(store.list_entries(&account.id, 10).unwrap().len(), 1);
        assert!(!store.row_locks().is_locked(&account.id));
    }

    #[test]
    fn test_settlement_applied_once() {
        let store = test_store();
        let account = persisted(&store);
        let options = CommitOptions::default().with_settlement_id("stl-42");

        let first = store.find_by_id(&account.id).unwrap();
        first.add_balance(dec("30"));
        assert!(store.commit_balance(&first, &options).unwrap().applied);

        let redelivered = store.find_by_id(&account.id).unwrap();
        redelivered.add_balance(dec("30"));
        let outcome = store.commit_balance(&redelivered, &options).unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.balance, dec("30"));
        assert_eq!(store.list_entries(&account.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_held_row_lock_times_out_and_leaves_balance() {
        let store = test_store();
        let account = persisted(&store);
        let other = Account::new("Bob", "b@x.com");
        store.save(&other).unwrap();

        let _held = store
            .row_locks()
            .acquire(&account.id, Instant::now() + Duration::from_secs(1))
            .unwrap();

        account.add_balance(Decimal::TEN);
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = store
            .commit_balance(&account, &CommitOptions::default().with_deadline(deadline))
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout));

        // A different row is not blocked
        other.add_balance(Decimal::TEN);
        let deadline = Instant::now() + Duration::from_millis(500);
        store
            .commit_balance(&other, &CommitOptions::default().with_deadline(deadline))
            .unwrap();

        assert_eq!(store.find_by_id(&account.id).unwrap().balance(), Decimal::ZERO);
        assert_eq!(store.find_by_id(&other.id).unwrap().balance(), Decimal::TEN);
    }

    #[test]
    fn test_replica_shares_data_and_row_locks() {
        let store = test_store();
        let account = persisted(&store);
        let replica = store.replica().unwrap();

        assert_eq!(
            replica.find_by_id(&account.id).unwrap().snapshot(),
            account.snapshot()
        );

        let _held = store
            .row_locks()
            .acquire(&account.id, Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert!(replica.row_locks().is_locked(&account.id));
        assert!(!store.detached_replica().unwrap().row_locks().is_locked(&account.id));
    }

    #[test]
    fn test_list_entries_newest_first() {
        let store = test_store();
        let account = persisted(&store);
        for amount in ["5", "-2", "7.25"] {
            let fresh = store.find_by_id(&account.id).unwrap();
            fresh.add_balance(dec(amount));
            store.commit_balance(&fresh, &CommitOptions::default()).unwrap();
        }

        let entries = store.list_entries(&account.id, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, dec("7.25"));
        assert_eq!(entries[0].balance_after, dec("10.25"));
        assert_eq!(entries[1].amount, dec("-2"));
        assert!(entries[0].created_at > entries[1].created_at);
    }

    #[test]
    fn test_error_classification() {
        assert!(is_retryable_error("Database is locked"));
        assert!(is_retryable_error("IO Error: Could not set lock on file"));
        assert!(!is_retryable_error("Permission denied"));
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.duckdb");
        let id = {
            let store = DuckDbAccountStore::open(&path, StoreOptions::default()).unwrap();
            store.ensure_schema().unwrap();
            persisted(&store).id
        };

        let reopened = DuckDbAccountStore::open(&path, StoreOptions::default()).unwrap();
        reopened.ensure_schema().unwrap();
        assert_eq!(reopened.find_by_id(&id).unwrap().name, "Alice");
        assert_eq!(reopened.db_path(), Some(path.as_path()));
    }
}
