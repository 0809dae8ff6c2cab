//! Account balance tracking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_common::{AccountId, Result};

/// Current monetary position of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Current amount.
    pub amount: Decimal,
    /// When this balance was last written.
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Create a balance record.
    pub fn new(account_id: AccountId, amount: Decimal, updated_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            amount,
            updated_at,
        }
    }

    /// Check if the balance is below zero.
    pub fn is_overdrawn(&self) -> bool {
        self.amount < Decimal::ZERO
    }
}

/// Durable mapping from account to balance.
///
/// A store persists and retrieves; overdraft rules and every other business
/// check live in the engine.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Read an account's balance. `None` if the account has no record.
    async fn read(&self, account: AccountId) -> Result<Option<AccountBalance>>;

    /// Set an account's balance, creating the record if absent.
    async fn write(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance>;
}
