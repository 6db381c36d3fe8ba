//! Core domain entities
//!
//! The account aggregate, journal entries and the ledger error taxonomy.
//! Nothing in here performs I/O.

pub mod account;
mod entry;
pub mod result;

pub use account::{Account, AccountSnapshot, ApiKeyGenerator, RandomApiKeyGenerator};
pub use entry::LedgerEntry;
