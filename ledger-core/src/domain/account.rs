//! Account aggregate
//!
//! An [`Account`] carries the identity of one ledger account and its balance.
//! Identity and profile fields are plain data; the balance lives behind a
//! per-instance mutex and can only be changed through [`Account::add_balance`]
//! (in memory) or [`Account::mark_committed`] (after the store has persisted a
//! new value).

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source of API keys for new accounts
pub trait ApiKeyGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 128-bit random keys, hex encoded (32 characters)
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomApiKeyGenerator;

impl ApiKeyGenerator for RandomApiKeyGenerator {
    fn generate(&self) -> String {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        hex::encode(bytes)
    }
}

/// Current time truncated to microseconds (the precision we persist)
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Next update timestamp for an account last touched at `previous`.
///
/// Never returns a value at or before `previous`, even if the wall clock
/// stepped backwards.
pub fn advance_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_micros();
    let floor = previous + Duration::microseconds(1);
    if now < floor {
        floor
    } else {
        now
    }
}

/// Storage format for timestamps: RFC 3339, microseconds, `Z` suffix
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Copy)]
struct BalanceState {
    balance: Decimal,
    /// Sum of amounts applied since load / last commit
    pending: Decimal,
    version: i64,
    updated_at: DateTime<Utc>,
}

/// A payment-gateway account
#[derive(Debug)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<BalanceState>,
}

impl Account {
    /// Create a new account with a random API key and a zero balance
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self::with_key_generator(name, email, &RandomApiKeyGenerator)
    }

    /// Create a new account taking its API key from `keys`
    pub fn with_key_generator(
        name: impl Into<String>,
        email: impl Into<String>,
        keys: &dyn ApiKeyGenerator,
    ) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            api_key: keys.generate(),
            created_at: now,
            state: Mutex::new(BalanceState {
                balance: Decimal::ZERO,
                pending: Decimal::ZERO,
                version: 0,
                updated_at: now,
            }),
        }
    }

    /// Rebuild an account from persisted state
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: String,
        name: String,
        email: String,
        api_key: String,
        balance: Decimal,
        version: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            email,
            api_key,
            created_at,
            state: Mutex::new(BalanceState {
                balance,
                pending: Decimal::ZERO,
                version,
                updated_at,
            }),
        }
    }

    /// Apply a credit (positive) or debit (negative) in memory.
    ///
    /// Callers sharing one instance across threads are serialized here. The
    /// guard is released on every exit path, unwinding included.
    pub fn add_balance(&self, amount: Decimal) {
        let mut state = self.state.lock();
        state.balance += amount;
        state.pending += amount;
        state.updated_at = advance_timestamp(state.updated_at);
    }

    /// Install the state the store just committed and clear the pending delta
    pub fn mark_committed(&self, balance: Decimal, version: i64, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.balance = balance;
        state.pending = Decimal::ZERO;
        state.version = version;
        state.updated_at = updated_at;
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    /// Amount applied in memory that has not been committed yet
    pub fn pending_delta(&self) -> Decimal {
        self.state.lock().pending
    }

    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.lock().updated_at
    }

    /// Immutable copy of the externally visible fields
    pub fn snapshot(&self) -> AccountSnapshot {
        let state = *self.state.lock();
        AccountSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            balance: state.balance,
            api_key: self.api_key.clone(),
            version: state.version,
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Snapshot of an account returned from every query and mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub name: String,
    pub email: String,
    pub balance: Decimal,
    pub api_key: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
