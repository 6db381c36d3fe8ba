//! Port definitions (hexagonal architecture)
//!
//! The ledger service depends only on these traits, not on the DuckDB
//! adapter that implements them.

mod account_store;

pub use account_store::{
    AccountStore, CommitOptions, CommittedBalance, StoreError, StoreResult, BALANCE_LIMIT,
};
