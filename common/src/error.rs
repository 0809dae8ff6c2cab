//! Error types for ledger operations.

use crate::{AccountId, TransactionId, TransactionStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for ledger operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Amount is not strictly positive or not representable.
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Transfer source and destination are the same account.
    #[error("Transfer from account {0} to itself")]
    SameAccountTransfer(AccountId),

    /// Mutation would violate the overdraft policy.
    #[error("Insufficient funds in account {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        required: Decimal,
        available: Decimal,
    },

    /// Mutation would take a balance outside the persisted range.
    #[error("Balance of account {0} would leave the storable range")]
    BalanceOutOfRange(AccountId),

    /// Account has no balance record.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Transaction record does not exist.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Deadline exceeded while waiting for a resource.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Underlying persistence failed.
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// A transfer could not be compensated, or a terminal status could not be
    /// recorded. The transaction log must be reconciled by hand.
    #[error("Unrecoverable state for transaction {transaction_id}: {reason}")]
    UnrecoverableState {
        transaction_id: TransactionId,
        reason: String,
    },

    /// Status change not permitted by the transaction state machine.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Check if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout(_) | LedgerError::StorageFailure(_)
        )
    }

    /// Check if the error requires operator attention.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, LedgerError::UnrecoverableState { .. })
    }

    /// Check if the error was raised before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_) | LedgerError::SameAccountTransfer(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SameAccountTransfer(_) => "SAME_ACCOUNT_TRANSFER",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::BalanceOutOfRange(_) => "BALANCE_OUT_OF_RANGE",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::StorageFailure(_) => "STORAGE_FAILURE",
            LedgerError::UnrecoverableState { .. } => "UNRECOVERABLE_STATE",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Result type alias used by the ledger crates.
pub type LedgerResult<T> = Result<T>;
