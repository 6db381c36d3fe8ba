//! Account service - the only way balances change
//!
//! Every mutation follows the same path: load the aggregate from the store,
//! apply the amount under the aggregate's guard, commit under the row lock,
//! and hand back a snapshot. Aggregates are never cached between calls.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::result::{LedgerError, Result};
use crate::domain::{Account, AccountSnapshot, ApiKeyGenerator, LedgerEntry, RandomApiKeyGenerator};
use crate::ports::{AccountStore, CommitOptions, CommittedBalance, StoreError};

/// Largest accepted adjustment magnitude (10^13)
const MAX_AMOUNT: Decimal = Decimal::from_parts(1_316_134_912, 2_328, 0, false, 0);

/// Fractional digits the ledger stores
const AMOUNT_SCALE: u32 = 4;

/// First pause between conflicting commits (doubles per attempt)
const CONFLICT_BACKOFF_MS: u64 = 2;

/// Doublings after which the conflict pause stops growing
const MAX_BACKOFF_SHIFT: u32 = 8;

/// Ledger rules applied by the service
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    /// When false, debits may not take a balance below zero
    pub allow_negative_balance: bool,
    /// Commit attempts before a write conflict is returned to the caller
    pub max_commit_attempts: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            allow_negative_balance: true,
            max_commit_attempts: 5,
        }
    }
}

impl LedgerPolicy {
    fn floor(&self) -> Option<Decimal> {
        if self.allow_negative_balance {
            None
        } else {
            Some(Decimal::ZERO)
        }
    }
}

/// Result of applying a settlement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "account", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// First delivery; the amount was committed
    Applied(AccountSnapshot),
    /// Redelivery; nothing was written
    AlreadyApplied(AccountSnapshot),
}

impl SettlementOutcome {
    pub fn snapshot(&self) -> &AccountSnapshot {
        match self {
            Self::Applied(s) | Self::AlreadyApplied(s) => s,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Account ledger service
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    policy: LedgerPolicy,
    keys: Arc<dyn ApiKeyGenerator>,
}

impl AccountService {
    pub fn new(store: Arc<dyn AccountStore>, policy: LedgerPolicy) -> Self {
        Self::with_key_generator(store, policy, Arc::new(RandomApiKeyGenerator))
    }

    pub fn with_key_generator(
        store: Arc<dyn AccountStore>,
        policy: LedgerPolicy,
        keys: Arc<dyn ApiKeyGenerator>,
    ) -> Self {
        Self { store, policy, keys }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Create an account with a zero balance and a fresh API key
    pub fn create_account(&self, name: &str, email: &str) -> Result<AccountSnapshot> {
        validate_profile(name, email)?;

        let account = Account::with_key_generator(name, email, self.keys.as_ref());

        match self.store.find_by_api_key(&account.api_key) {
            Ok(_) => return Err(LedgerError::DuplicateApiKey),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        // The UNIQUE constraint still catches a key inserted since the lookup
        self.store.save(&account)?;

        info!(account_id = %account.id, "account created");
        Ok(account.snapshot())
    }

    /// Credit (positive) or debit (negative) the account owning `api_key`
    pub fn adjust_balance(&self, api_key: &str, amount: Decimal) -> Result<AccountSnapshot> {
        self.adjust(api_key, amount, CommitOptions::default())
            .map(|(snapshot, _)| snapshot)
    }

    /// Like [`adjust_balance`](Self::adjust_balance), giving up at `deadline`.
    ///
    /// Expiry while waiting for the row or before commit yields
    /// [`LedgerError::Timeout`] and writes nothing.
    pub fn adjust_balance_with_deadline(
        &self,
        api_key: &str,
        amount: Decimal,
        deadline: Instant,
    ) -> Result<AccountSnapshot> {
        self.adjust(api_key, amount, CommitOptions::default().with_deadline(deadline))
            .map(|(snapshot, _)| snapshot)
    }

    /// Apply a settlement result at most once per `settlement_id`
    pub fn apply_settlement(
        &self,
        api_key: &str,
        amount: Decimal,
        settlement_id: &str,
    ) -> Result<SettlementOutcome> {
        if settlement_id.trim().is_empty() {
            return Err(LedgerError::invalid_input("settlement id must not be blank"));
        }

        let options = CommitOptions::default().with_settlement_id(settlement_id);
        let (snapshot, applied) = self.adjust(api_key, amount, options)?;
        if applied {
            Ok(SettlementOutcome::Applied(snapshot))
        } else {
            Ok(SettlementOutcome::AlreadyApplied(snapshot))
        }
    }

    pub fn find_by_api_key(&self, api_key: &str) -> Result<AccountSnapshot> {
        Ok(self.store.find_by_api_key(api_key)?.snapshot())
    }

    pub fn find_by_id(&self, id: &str) -> Result<AccountSnapshot> {
        Ok(self.store.find_by_id(id)?.snapshot())
    }

    /// Most recent journal entries of an account, newest first
    pub fn entries(&self, id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.store.find_by_id(id)?;
        Ok(self.store.list_entries(id, limit)?)
    }

    pub fn count_accounts(&self) -> Result<u64> {
        Ok(self.store.count_accounts()?)
    }

    fn adjust(
        &self,
        api_key: &str,
        amount: Decimal,
        mut options: CommitOptions,
    ) -> Result<(AccountSnapshot, bool)> {
        validate_amount(amount)?;
        options.floor = self.policy.floor();

        let account = self.store.find_by_api_key(api_key)?;
        account.add_balance(amount);

        let committed = self.commit_with_retry(&account, &options)?;
        if !committed.applied {
            debug!(account_id = %account.id, "settlement redelivered, nothing written");
            return Ok((self.store.find_by_id(&account.id)?.snapshot(), false));
        }

        account.mark_committed(committed.balance, committed.version, committed.updated_at);
        debug!(account_id = %account.id, version = committed.version, "balance adjusted");
        Ok((account.snapshot(), true))
    }

    fn commit_with_retry(
        &self,
        account: &Account,
        options: &CommitOptions,
    ) -> Result<CommittedBalance> {
        let attempts = self.policy.max_commit_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.commit_balance(account, options) {
                Ok(committed) => return Ok(committed),
                Err(StoreError::Conflict(msg)) if attempt < attempts => {
                    let delay = conflict_backoff(attempt);
                    if let Some(deadline) = options.deadline {
                        if Instant::now() + delay >= deadline {
                            return Err(LedgerError::Timeout);
                        }
                    }
                    warn!(
                        account_id = %account.id,
                        attempt,
                        max = attempts,
                        error = %msg,
                        "write conflict, retrying commit"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pause before retrying after the `attempt`-th conflicting commit
fn conflict_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    Duration::from_millis(CONFLICT_BACKOFF_MS << shift)
}

fn validate_profile(name: &str, email: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LedgerError::invalid_input("name must not be blank"));
    }
    if email.trim().is_empty() || !email.contains('@') {
        return Err(LedgerError::invalid_input("email must contain '@'"));
    }
    Ok(())
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount.is_zero() {
        return Err(LedgerError::invalid_amount("amount must not be zero"));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(LedgerError::invalid_amount(format!(
            "at most {} decimal places are allowed",
            AMOUNT_SCALE
        )));
    }
    if amount.abs() > MAX_AMOUNT {
        return Err(LedgerError::invalid_amount("amount is too large"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::adapters::duckdb::{DuckDbAccountStore, StoreOptions};
    use crate::ports::StoreResult;

    struct FixedKey(&'static str);

    impl ApiKeyGenerator for FixedKey {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    /// Reports a write conflict for the first `failures` commits
    struct ConflictingStore {
        inner: DuckDbAccountStore,
        failures: AtomicU32,
    }

    impl AccountStore for ConflictingStore {
        fn save(&self, account: &Account) -> StoreResult<()> {
            self.inner.save(account)
        }

        fn find_by_api_key(&self, api_key: &str) -> StoreResult<Account> {
            self.inner.find_by_api_key(api_key)
        }

        fn find_by_id(&self, id: &str) -> StoreResult<Account> {
            self.inner.find_by_id(id)
        }

        fn commit_balance(
            &self,
            account: &Account,
            options: &CommitOptions,
        ) -> StoreResult<CommittedBalance> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("simulated".to_string()));
            }
            self.inner.commit_balance(account, options)
        }

        fn list_entries(&self, account_id: &str, limit: usize) -> StoreResult<Vec<LedgerEntry>> {
            self.inner.list_entries(account_id, limit)
        }

        fn count_accounts(&self) -> StoreResult<u64> {
            self.inner.count_accounts()
        }
    }

    fn memory_store() -> DuckDbAccountStore {
        let store = DuckDbAccountStore::open_in_memory(StoreOptions::default()).unwrap();
        store.ensure_schema().unwrap();
        store
    }

    fn service_with(policy: LedgerPolicy) -> AccountService {
        AccountService::new(Arc::new(memory_store()), policy)
    }

    fn service() -> AccountService {
        service_with(LedgerPolicy::default())
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_create_account() {
        let service = service();
        let account = service.create_account("Alice", "a@x.com").unwrap();

        assert_eq!(account.balance, Decimal::ZERO);
        assert!(!account.id.is_empty());
        assert!(!account.api_key.is_empty());
        assert_eq!(account.created_at, account.updated_at);
        assert_eq!(service.count_accounts().unwrap(), 1);
    }

    #[test]
    fn test_create_account_rejects_bad_profile() {
        let service = service();
        for (name, email) in [("", "a@x.com"), ("  ", "a@x.com"), ("Alice", ""), ("Alice", "ax.com")] {
            let err = service.create_account(name, email).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidInput(_)), "{name:?} {email:?}");
        }
        assert_eq!(service.count_accounts().unwrap(), 0);
    }

    #[test]
    fn test_colliding_key_is_duplicate() {
        let service = AccountService::with_key_generator(
            Arc::new(memory_store()),
            LedgerPolicy::default(),
            Arc::new(FixedKey("collide")),
        );

        service.create_account("A", "a@x.com").unwrap();
        let err = service.create_account("B", "b@x.com").unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateApiKey));
        assert_eq!(service.count_accounts().unwrap(), 1);
    }

    #[test]
    fn test_amount_validation() {
        let service = service();
        let account = service.create_account("Alice", "a@x.com").unwrap();

        for amount in [Decimal::ZERO, dec("0.00001"), dec("10000000000000.0001"), dec("-20000000000000")] {
            let err = service.adjust_balance(&account.api_key, amount).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)), "{amount}");
        }

        // Trailing zeros beyond four places are fine
        let ok = service.adjust_balance(&account.api_key, dec("1.250000")).unwrap();
        assert_eq!(ok.balance, dec("1.25"));
        assert_eq!(
            service.adjust_balance(&account.api_key, MAX_AMOUNT).unwrap().balance,
            MAX_AMOUNT + dec("1.25")
        );
    }

    #[test]
    fn test_credits_past_storable_balance_are_rejected() {
        let service = service();
        let account = service.create_account("Whale", "w@x.com").unwrap();

        for _ in 0..9 {
            service.adjust_balance(&account.api_key, MAX_AMOUNT).unwrap();
        }
        let err = service.adjust_balance(&account.api_key, MAX_AMOUNT).unwrap_err();

        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Rejected);
        assert!(!err.to_string().contains("Conversion"));
        let stored = service.find_by_id(&account.id).unwrap();
        assert_eq!(stored.balance, MAX_AMOUNT * Decimal::from(9));
        assert_eq!(stored.version, 9);
    }

    #[test]
    fn test_conflict_backoff_is_bounded() {
        assert_eq!(conflict_backoff(1), Duration::from_millis(CONFLICT_BACKOFF_MS));
        assert_eq!(conflict_backoff(2), Duration::from_millis(CONFLICT_BACKOFF_MS * 2));
        let ceiling = conflict_backoff(MAX_BACKOFF_SHIFT + 1);
        assert_eq!(conflict_backoff(70), ceiling);
        assert_eq!(conflict_backoff(u32::MAX), ceiling);
        assert!(ceiling < Duration::from_secs(1));
    }

    #[test]
    fn test_adjust_additivity() {
        let service = service();
        let split = service.create_account("Split", "s@x.com").unwrap();
        let whole = service.create_account("Whole", "w@x.com").unwrap();

        service.adjust_balance(&split.api_key, dec("12.5")).unwrap();
        let a = service.adjust_balance(&split.api_key, dec("-3.25")).unwrap();
        let b = service.adjust_balance(&whole.api_key, dec("9.25")).unwrap();

        assert_eq!(a.balance, b.balance);
        assert_eq!(a.version, 2);
        assert_eq!(b.version, 1);
    }

    #[test]
    fn test_unknown_key_and_id() {
        let service = service();
        assert!(matches!(
            service.adjust_balance("missing", Decimal::ONE),
            Err(LedgerError::AccountNotFound)
        ));
        assert!(matches!(
            service.find_by_api_key("missing"),
            Err(LedgerError::AccountNotFound)
        ));
        assert!(matches!(
            service.find_by_id("missing"),
            Err(LedgerError::AccountNotFound)
        ));
        assert!(matches!(
            service.entries("missing", 10),
            Err(LedgerError::AccountNotFound)
        ));
    }

    #[test]
    fn test_negative_balance_policy() {
        let lenient = service();
        let account = lenient.create_account("Alice", "a@x.com").unwrap();
        assert_eq!(
            lenient.adjust_balance(&account.api_key, dec("-5")).unwrap().balance,
            dec("-5")
        );

        let strict = service_with(LedgerPolicy {
            allow_negative_balance: false,
            ..LedgerPolicy::default()
        });
        let account = strict.create_account("Bob", "b@x.com").unwrap();
        strict.adjust_balance(&account.api_key, dec("10")).unwrap();

        let err = strict.adjust_balance(&account.api_key, dec("-10.01")).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(strict.find_by_id(&account.id).unwrap().balance, dec("10"));
        assert_eq!(
            strict.adjust_balance(&account.api_key, dec("-10")).unwrap().balance,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_settlement_is_idempotent() {
        let service = service();
        let account = service.create_account("Merchant", "m@x.com").unwrap();

        let first = service.apply_settlement(&account.api_key, dec("99.99"), "stl-1").unwrap();
        let again = service.apply_settlement(&account.api_key, dec("99.99"), "stl-1").unwrap();
        let other = service.apply_settlement(&account.api_key, dec("0.01"), "stl-2").unwrap();

        assert!(first.is_applied());
        assert!(!again.is_applied());
        assert_eq!(again.snapshot().balance, dec("99.99"));
        assert_eq!(again.snapshot().version, 1);
        assert_eq!(other.snapshot().balance, dec("100"));
        assert_eq!(service.entries(&account.id, 10).unwrap().len(), 2);

        assert!(matches!(
            service.apply_settlement(&account.api_key, Decimal::ONE, " "),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_conflict_is_retried() {
        let store = Arc::new(ConflictingStore {
            inner: memory_store(),
            failures: AtomicU32::new(0),
        });
        let service = AccountService::new(store.clone(), LedgerPolicy::default());
        let account = service.create_account("Alice", "a@x.com").unwrap();

        store.failures.store(2, Ordering::SeqCst);
        let snapshot = service.adjust_balance(&account.api_key, dec("7")).unwrap();
        assert_eq!(snapshot.balance, dec("7"));

        store.failures.store(10, Ordering::SeqCst);
        let err = service.adjust_balance(&account.api_key, dec("7")).unwrap_err();
        assert!(matches!(err, LedgerError::Storage(StoreError::Conflict(_))));
        assert!(err.is_retryable());
        assert_eq!(service.find_by_id(&account.id).unwrap().balance, dec("7"));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let service = service();
        let account = service.create_account("Alice", "a@x.com").unwrap();

        let err = service
            .adjust_balance_with_deadline(&account.api_key, Decimal::ONE, Instant::now())
            .unwrap_err();

        assert!(matches!(err, LedgerError::Timeout));
        assert_eq!(service.find_by_id(&account.id).unwrap().balance, Decimal::ZERO);
    }

    #[test]
    fn test_settlement_outcome_serializes_with_status() {
        let service = service();
        let account = service.create_account("Alice", "a@x.com").unwrap();
        let outcome = service.apply_settlement(&account.api_key, Decimal::ONE, "s").unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "applied");
        assert_eq!(json["account"]["name"], "Alice");
    }
}
