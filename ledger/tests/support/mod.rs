//! Store wrappers that inject failures and delays into the in-memory backends.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use tally_common::{
    AccountId, LedgerError, NewTransaction, Result, TransactionId, TransactionRecord,
    TransactionStatus,
};
use tally_ledger::{
    AccountBalance, BalanceStore, LedgerConfig, LedgerEngine, MemoryBalanceStore,
    MemoryTransactionLog, TransactionLog,
};

/// Balance store that can refuse writes per account and slow every write.
#[derive(Default)]
pub struct FaultyBalanceStore {
    pub inner: MemoryBalanceStore,
    /// Writes still allowed per account; absent means unlimited.
    write_budget: Mutex<HashMap<AccountId, usize>>,
    /// Accounts whose writes panic.
    panicking: Mutex<HashSet<AccountId>>,
    write_delay: Mutex<Option<Duration>>,
}

impl FaultyBalanceStore {
    /// Allow `writes` more writes to `account`, then fail every later one.
    pub fn fail_writes_after(&self, account: AccountId, writes: usize) {
        self.write_budget.lock().insert(account, writes);
    }

    pub fn panic_on_write(&self, account: AccountId) {
        self.panicking.lock().insert(account);
    }

    pub fn heal(&self, account: AccountId) {
        self.write_budget.lock().remove(&account);
        self.panicking.lock().remove(&account);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl BalanceStore for FaultyBalanceStore {
    async fn read(&self, account: AccountId) -> Result<Option<AccountBalance>> {
        self.inner.read(account).await
    }

    async fn write(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.panicking.lock().contains(&account) {
            panic!("injected panic writing account {}", account);
        }

        {
            let mut budget = self.write_budget.lock();
            if let Some(remaining) = budget.get_mut(&account) {
                if *remaining == 0 {
                    return Err(LedgerError::StorageFailure(format!(
                        "injected write failure on account {}",
                        account
                    )));
                }
                *remaining -= 1;
            }
        }

        self.inner.write(account, amount).await
    }
}

/// Transaction log that can refuse appends and status updates.
#[derive(Default)]
pub struct FaultyLog {
    pub inner: MemoryTransactionLog,
    fail_appends: AtomicBool,
    failing_updates: AtomicUsize,
}

impl FaultyLog {
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` status updates.
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionLog for FaultyLog {
    async fn append(&self, intent: NewTransaction) -> Result<TransactionRecord> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageFailure("injected append failure".into()));
        }
        self.inner.append(intent).await
    }

    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::StorageFailure("injected update failure".into()));
        }
        self.inner.update_status(id, status).await
    }

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.inner.get(id).await
    }

    async fn query_by_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.query_by_account(account).await
    }
}

/// Engine wired to fault-injecting stores, with handles to both.
pub struct Harness {
    pub engine: Arc<LedgerEngine>,
    pub balances: Arc<FaultyBalanceStore>,
    pub log: Arc<FaultyLog>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = LedgerConfig::default();
        config.finalize_config.backoff = Duration::from_millis(1);
        Self::with_config(config)
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let balances = Arc::new(FaultyBalanceStore::default());
        let log = Arc::new(FaultyLog::default());
        let engine = LedgerEngine::new(balances.clone(), log.clone(), config)
            .expect("valid test configuration");
        Self {
            engine: Arc::new(engine),
            balances,
            log,
        }
    }
}

pub fn acct(id: i64) -> AccountId {
    AccountId::new(id)
}

/// Decimal from a string literal such as `"100.00"`.
pub fn dec(value: &str) -> Decimal {
    value.parse().expect("decimal literal")
}
