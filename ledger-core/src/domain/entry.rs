//! Ledger journal entry

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One committed balance change, written in the same transaction as the
/// balance itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub balance_after: Decimal,
    /// Upstream settlement identifier, present for idempotent adjustments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
