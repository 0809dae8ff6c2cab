//! In-memory storage for tests, simulation and development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use tally_common::{
    now, AccountId, LedgerError, NewTransaction, Result, TransactionId, TransactionRecord,
    TransactionStatus,
};

use crate::balance::{AccountBalance, BalanceStore};
use crate::journal::TransactionLog;

/// In-memory balance store.
///
/// Every write replaces a whole record under the write lock, so readers see
/// either the previous or the new balance.
#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    balances: RwLock<HashMap<AccountId, AccountBalance>>,
}

impl MemoryBalanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All balances, ordered by account.
    pub fn snapshot(&self) -> Vec<AccountBalance> {
        let mut balances: Vec<_> = self.balances.read().values().cloned().collect();
        balances.sort_by_key(|b| b.account_id);
        balances
    }

    /// Sum of all balances.
    pub fn total(&self) -> Decimal {
        self.balances.read().values().map(|b| b.amount).sum()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn read(&self, account: AccountId) -> Result<Option<AccountBalance>> {
        Ok(self.balances.read().get(&account).cloned())
    }

    async fn write(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance> {
        let balance = AccountBalance::new(account, amount, now());
        self.balances.write().insert(account, balance.clone());
        Ok(balance)
    }
}

#[derive(Debug)]
struct LogState {
    next_id: TransactionId,
    records: BTreeMap<TransactionId, TransactionRecord>,
    by_account: HashMap<AccountId, Vec<TransactionId>>,
}

/// In-memory transaction log.
#[derive(Debug)]
pub struct MemoryTransactionLog {
    state: RwLock<LogState>,
}

impl MemoryTransactionLog {
    /// Create an empty log. The first record gets id 1.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                next_id: TransactionId::new(1),
                records: BTreeMap::new(),
                by_account: HashMap::new(),
            }),
        }
    }

    /// All records in creation order.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.state.read().records.values().cloned().collect()
    }

    /// Records still Pending.
    pub fn pending(&self) -> Vec<TransactionRecord> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.status == TransactionStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }
}

impl Default for MemoryTransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionLog for MemoryTransactionLog {
    async fn append(&self, intent: NewTransaction) -> Result<TransactionRecord> {
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id = id.next();

        let record = intent.into_record(id, now());
        for account in indexed_accounts(&record) {
            state.by_account.entry(account).or_default().push(id);
        }
        state.records.insert(id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;
        record.transition_to(status, now())?;
        Ok(record.clone())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        Ok(self.state.read().records.get(&id).cloned())
    }

    async fn query_by_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        let state = self.state.read();
        let records = state
            .by_account
            .get(&account)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.records.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }
}

/// Accounts a record is indexed under.
fn indexed_accounts(record: &TransactionRecord) -> Vec<AccountId> {
    let mut accounts = vec![record.from_account];
    if let Some(to) = record.to_account.filter(|to| *to != record.from_account) {
        accounts.push(to);
    }
    accounts
}
