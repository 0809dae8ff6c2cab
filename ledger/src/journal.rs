//! Transaction log: the append-mostly record of every attempted mutation.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use tally_common::{
    replay_balance, AccountId, NewTransaction, Result, TransactionId, TransactionRecord,
    TransactionStatus,
};

/// Durable store of transaction records.
///
/// Identifiers are assigned by the log in strictly increasing order and are
/// never reused. Status updates follow the transaction state machine; a
/// backend rejects anything else with `InvalidTransition`.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Append a Pending record for `intent` and return it with its new id.
    async fn append(&self, intent: NewTransaction) -> Result<TransactionRecord>;

    /// Move a record to `status` and return the updated record.
    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<TransactionRecord>;

    /// Get a record by id. `None` if no such record exists.
    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>>;

    /// Records where `account` is source or destination, ordered by id.
    async fn query_by_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>>;
}

/// Order-stable snapshot of an account's transaction records.
///
/// Iterating does not touch the log, and a history can be iterated any number
/// of times with the same result. Records appended after the snapshot was
/// taken are not visible.
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    account: AccountId,
    records: Arc<[TransactionRecord]>,
}

impl TransactionHistory {
    /// Wrap records already ordered by creation.
    pub fn new(account: AccountId, records: Vec<TransactionRecord>) -> Self {
        Self {
            account,
            records: records.into(),
        }
    }

    /// Account the history belongs to.
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// Iterate records in creation order.
    pub fn iter(&self) -> std::slice::Iter<'_, TransactionRecord> {
        self.records.iter()
    }

    /// Records as a slice.
    pub fn as_slice(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records with the given status, in creation order.
    pub fn with_status(
        &self,
        status: TransactionStatus,
    ) -> impl Iterator<Item = &TransactionRecord> + '_ {
        self.records.iter().filter(move |r| r.status == status)
    }

    /// Balance implied by folding the Completed records from zero.
    pub fn replayed_balance(&self) -> Decimal {
        replay_balance(self.records.iter(), self.account)
    }
}

impl<'a> IntoIterator for &'a TransactionHistory {
    type Item = &'a TransactionRecord;
    type IntoIter = std::slice::Iter<'a, TransactionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completed(id: i64, intent: NewTransaction) -> TransactionRecord {
        let mut record = intent.into_record(TransactionId::new(id), Utc::now());
        record
            .transition_to(TransactionStatus::Completed, Utc::now())
            .unwrap();
        record
    }

    #[test]
    fn test_history_is_restartable() {
        let account = AccountId::new(1);
        let history = TransactionHistory::new(
            account,
            vec![
                completed(1, NewTransaction::credit(account, Decimal::from(100)).unwrap()),
                completed(2, NewTransaction::debit(account, Decimal::from(30)).unwrap()),
            ],
        );

        let first: Vec<_> = history.iter().map(|r| r.id).collect();
        let second: Vec<_> = (&history).into_iter().map(|r| r.id).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![TransactionId::new(1), TransactionId::new(2)]);
        assert_eq!(history.replayed_balance(), Decimal::from(70));
        assert_eq!(history.with_status(TransactionStatus::Completed).count(), 2);
    }
}
