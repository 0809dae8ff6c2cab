//! Transaction records and their status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{LedgerError, Result};
use crate::monetary::ensure_valid_amount;
use crate::{AccountId, TransactionId};

/// Kind of balance mutation a transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Increase the source account's balance.
    Credit,
    /// Decrease the source account's balance.
    Debit,
    /// Move funds from the source account to the destination account.
    Transfer,
}

impl TransactionKind {
    /// Stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionKind::Credit),
            "debit" => Ok(TransactionKind::Debit),
            "transfer" => Ok(TransactionKind::Transfer),
            other => Err(UnknownVariant::new("transaction kind", other)),
        }
    }
}

/// Outcome marker of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Intent recorded, balances not yet finalized.
    Pending,
    /// All balance deltas applied.
    Completed,
    /// No balance delta remains applied.
    Failed,
}

impl TransactionStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => {
                &[TransactionStatus::Completed, TransactionStatus::Failed]
            }
            TransactionStatus::Completed => &[],
            TransactionStatus::Failed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(UnknownVariant::new("transaction status", other)),
        }
    }
}

/// Error when decoding a kind or status from its stored text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {what}: '{value}'")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// A validated request to mutate balances, before the log assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Account the operation is issued against (the debited side of a transfer).
    pub from_account: AccountId,
    /// Credited side of a transfer.
    pub to_account: Option<AccountId>,
    /// Strictly positive amount.
    pub amount: Decimal,
    /// Operation kind.
    pub kind: TransactionKind,
}

impl NewTransaction {
    /// Intent to credit `account`.
    pub fn credit(account: AccountId, amount: Decimal) -> Result<Self> {
        Ok(Self {
            from_account: account,
            to_account: None,
            amount: ensure_valid_amount(amount)?,
            kind: TransactionKind::Credit,
        })
    }

    /// Intent to debit `account`.
    pub fn debit(account: AccountId, amount: Decimal) -> Result<Self> {
        Ok(Self {
            from_account: account,
            to_account: None,
            amount: ensure_valid_amount(amount)?,
            kind: TransactionKind::Debit,
        })
    }

    /// Intent to move `amount` from `from` to `to`.
    pub fn transfer(from: AccountId, to: AccountId, amount: Decimal) -> Result<Self> {
        let amount = ensure_valid_amount(amount)?;
        if from == to {
            return Err(LedgerError::SameAccountTransfer(from));
        }
        Ok(Self {
            from_account: from,
            to_account: Some(to),
            amount,
            kind: TransactionKind::Transfer,
        })
    }

    /// Accounts whose balances this intent touches, in lock order.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> =
            std::iter::once(self.from_account).chain(self.to_account).collect();
        accounts.sort_unstable();
        accounts.dedup();
        accounts
    }

    /// Materialize the intent as a Pending record.
    pub fn into_record(self, id: TransactionId, created_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id,
            from_account: self.from_account,
            to_account: self.to_account,
            amount: self.amount,
            kind: self.kind,
            status: TransactionStatus::Pending,
            created_at,
            status_changed_at: created_at,
        }
    }
}

/// Immutable statement of intent plus a mutable outcome marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Log-assigned identifier.
    pub id: TransactionId,
    /// Source account.
    pub from_account: AccountId,
    /// Destination account (transfers only).
    pub to_account: Option<AccountId>,
    /// Strictly positive amount.
    pub amount: Decimal,
    /// Operation kind.
    pub kind: TransactionKind,
    /// Current status.
    pub status: TransactionStatus,
    /// When the record was appended.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub status_changed_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Transition to a new status.
    pub fn transition_to(&mut self, status: TransactionStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.status_changed_at = at;
        Ok(())
    }

    /// Check if the account is the source or destination of this record.
    pub fn involves(&self, account: AccountId) -> bool {
        self.from_account == account || self.to_account == Some(account)
    }

    /// Signed change this record contributes to `account`'s balance.
    ///
    /// Only Completed records contribute.
    pub fn balance_effect(&self, account: AccountId) -> Decimal {
        if self.status != TransactionStatus::Completed {
            return Decimal::ZERO;
        }
        match self.kind {
            TransactionKind::Credit if self.from_account == account => self.amount,
            TransactionKind::Debit if self.from_account == account => -self.amount,
            TransactionKind::Transfer if self.from_account == account => -self.amount,
            TransactionKind::Transfer if self.to_account == Some(account) => self.amount,
            _ => Decimal::ZERO,
        }
    }
}

/// Fold the Completed records affecting `account` from zero, in order.
pub fn replay_balance<'a, I>(records: I, account: AccountId) -> Decimal
where
    I: IntoIterator<Item = &'a TransactionRecord>,
{
    records
        .into_iter()
        .fold(Decimal::ZERO, |balance, record| {
            balance + record.balance_effect(account)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct(id: i64) -> AccountId {
        AccountId::new(id)
    }

    fn record(id: i64, intent: NewTransaction) -> TransactionRecord {
        intent.into_record(TransactionId::new(id), Utc::now())
    }

    #[test]
    fn test_transfer_validation() {
        assert!(matches!(
            NewTransaction::transfer(acct(1), acct(1), Decimal::ONE),
            Err(LedgerError::SameAccountTransfer(_))
        ));
        assert!(matches!(
            NewTransaction::transfer(acct(1), acct(2), Decimal::ZERO),
            Err(LedgerError::InvalidAmount(_))
        ));
        // Amount is checked before the account pair.
        assert!(matches!(
            NewTransaction::transfer(acct(1), acct(1), Decimal::NEGATIVE_ONE),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_lock_order() {
        let intent = NewTransaction::transfer(acct(9), acct(2), Decimal::TEN).unwrap();
        assert_eq!(intent.accounts(), vec![acct(2), acct(9)]);

        let intent = NewTransaction::credit(acct(4), Decimal::TEN).unwrap();
        assert_eq!(intent.accounts(), vec![acct(4)]);
    }

    #[test]
    fn test_valid_transitions() {
        let mut rec = record(1, NewTransaction::credit(acct(1), Decimal::TEN).unwrap());
        assert_eq!(rec.status, TransactionStatus::Pending);
        assert!(rec
            .transition_to(TransactionStatus::Completed, Utc::now())
            .is_ok());
        assert!(rec.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut rec = record(1, NewTransaction::debit(acct(1), Decimal::TEN).unwrap());
        rec.transition_to(TransactionStatus::Failed, Utc::now())
            .unwrap();

        for next in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(
                rec.transition_to(next, Utc::now()),
                Err(LedgerError::InvalidTransition {
                    from: TransactionStatus::Failed,
                    to: next,
                })
            );
        }
    }

    #[test]
    fn test_balance_effect() {
        let mut transfer = record(
            1,
            NewTransaction::transfer(acct(1), acct(2), Decimal::from(40)).unwrap(),
        );
        assert_eq!(transfer.balance_effect(acct(1)), Decimal::ZERO);

        transfer
            .transition_to(TransactionStatus::Completed, Utc::now())
            .unwrap();
        assert_eq!(transfer.balance_effect(acct(1)), Decimal::from(-40));
        assert_eq!(transfer.balance_effect(acct(2)), Decimal::from(40));
        assert_eq!(transfer.balance_effect(acct(3)), Decimal::ZERO);
        assert!(transfer.involves(acct(2)));
        assert!(!transfer.involves(acct(3)));
    }

    #[test]
    fn test_replay_balance() {
        let mut credit = record(1, NewTransaction::credit(acct(1), Decimal::from(100)).unwrap());
        credit
            .transition_to(TransactionStatus::Completed, Utc::now())
            .unwrap();
        let mut failed = record(2, NewTransaction::debit(acct(1), Decimal::from(150)).unwrap());
        failed
            .transition_to(TransactionStatus::Failed, Utc::now())
            .unwrap();
        let mut transfer = record(
            3,
            NewTransaction::transfer(acct(1), acct(2), Decimal::from(40)).unwrap(),
        );
        transfer
            .transition_to(TransactionStatus::Completed, Utc::now())
            .unwrap();

        let log = [credit, failed, transfer];
        assert_eq!(replay_balance(&log, acct(1)), Decimal::from(60));
        assert_eq!(replay_balance(&log, acct(2)), Decimal::from(40));
    }

    #[test]
    fn test_text_round_trip() {
        for kind in [
            TransactionKind::Credit,
            TransactionKind::Debit,
            TransactionKind::Transfer,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("refund".parse::<TransactionKind>().is_err());
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
