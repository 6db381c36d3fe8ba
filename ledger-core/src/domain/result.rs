//! Result and error types for the ledger service

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::ports::StoreError;

/// Errors returned by the ledger service
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("account not found")]
    AccountNotFound,

    #[error("api key already exists")]
    DuplicateApiKey,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient funds: balance may not fall below {floor}")]
    InsufficientFunds { floor: Decimal },

    #[error("operation timed out")]
    Timeout,

    #[error("storage error")]
    Storage(#[source] StoreError),
}

/// What a caller can do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The account does not exist
    NotFound,
    /// The account (or its key) already exists
    AlreadyExists,
    /// The request violates a ledger rule; retrying it unchanged will fail again
    Rejected,
    /// Transient; try again later
    Transient,
    /// Storage failure that retrying will not fix
    Internal,
}

impl LedgerError {
    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::InvalidAmount(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotFound => ErrorKind::NotFound,
            Self::DuplicateApiKey => ErrorKind::AlreadyExists,
            Self::InvalidAmount(_) | Self::InvalidInput(_) | Self::InsufficientFunds { .. } => {
                ErrorKind::Rejected
            }
            Self::Timeout => ErrorKind::Transient,
            Self::Storage(StoreError::DuplicateKey { .. }) => ErrorKind::AlreadyExists,
            Self::Storage(StoreError::NotFound) => ErrorKind::NotFound,
            Self::Storage(e) if e.is_retryable() => ErrorKind::Transient,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::AccountNotFound,
            StoreError::DuplicateKey { field: "api_key" } => Self::DuplicateApiKey,
            StoreError::LockTimeout => Self::Timeout,
            StoreError::InsufficientFunds { floor } => Self::InsufficientFunds { floor },
            StoreError::CapacityExceeded { limit } => Self::InvalidAmount(format!(
                "resulting balance must stay below {} in magnitude",
                limit
            )),
            other => {
                warn!(error = %other, "storage failure");
                Self::Storage(other)
            }
        }
    }
}

/// Ledger service result type
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Operation result with optional context (for JSON output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            context: None,
        }
    }

    /// Create a successful result with context
    pub fn ok_with_context(data: T, context: HashMap<String, serde_json::Value>) -> Self {
        Self {
            context: Some(context),
            ..Self::ok(data)
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_kind: None,
            context: None,
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                error_kind: Some(e.kind()),
                ..Self::fail(e.to_string())
            },
        }
    }
}
