//! Core ledger engine implementation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use tally_common::{
    format_amount, is_storable, AccountId, Deadline, LedgerError, LedgerResult, NewTransaction,
    Result, TransactionId, TransactionKind, TransactionRecord, TransactionStatus,
};

use crate::balance::{AccountBalance, BalanceStore};
use crate::config::{FinalizeConfig, LedgerConfig, OverdraftPolicy};
use crate::journal::{TransactionHistory, TransactionLog};
use crate::lock_manager::AccountLockManager;
use crate::metrics::EngineMetrics;
use crate::store::{
    self, MemoryBalanceStore, MemoryTransactionLog, PgBalanceStore, PgTransactionLog,
};

/// Connections opened when the engine builds its own PostgreSQL pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// The ledger engine applies credits, debits and transfers to account
/// balances and keeps a transaction record for every attempt.
///
/// Every mutation locks its accounts in ascending id order, appends a Pending
/// record, applies the balance delta(s) and records Completed or Failed
/// before the locks are released.
pub struct LedgerEngine {
    balances: Arc<dyn BalanceStore>,
    journal: Arc<dyn TransactionLog>,
    lock_manager: Arc<AccountLockManager>,
    metrics: Arc<EngineMetrics>,
    config: LedgerConfig,
}

/// Result of comparing an account's stored balance with its replayed history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub account: AccountId,
    /// Stored balance, zero when the account has no balance record.
    pub stored: Decimal,
    /// Fold of the account's Completed records from zero.
    pub replayed: Decimal,
}

impl BalanceCheck {
    /// Check if stored and replayed balances agree.
    pub fn is_consistent(&self) -> bool {
        self.stored == self.replayed
    }
}

impl LedgerEngine {
    /// Create an engine over the given stores.
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        journal: Arc<dyn TransactionLog>,
        config: LedgerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let lock_manager = Arc::new(AccountLockManager::new(
            config.lock_config.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            balances,
            journal,
            lock_manager,
            metrics,
            config,
        })
    }

    /// Create an engine over fresh in-memory stores.
    pub fn in_memory(config: LedgerConfig) -> Result<Self> {
        Self::new(
            Arc::new(MemoryBalanceStore::new()),
            Arc::new(MemoryTransactionLog::new()),
            config,
        )
    }

    /// Create an engine from configuration: PostgreSQL when a database URL is
    /// configured, in-memory stores otherwise.
    pub async fn from_config(config: LedgerConfig) -> Result<Self> {
        match config.database_url.clone() {
            Some(url) => {
                let pool = store::postgres::connect(&url, DEFAULT_POOL_SIZE).await?;
                info!("Using PostgreSQL storage");
                Self::new(
                    Arc::new(PgBalanceStore::new(pool.clone())),
                    Arc::new(PgTransactionLog::new(pool)),
                    config,
                )
            }
            None => {
                info!("Using in-memory storage");
                Self::in_memory(config)
            }
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn lock_manager(&self) -> &Arc<AccountLockManager> {
        &self.lock_manager
    }

    /// Start the periodic sweep of idle account locks.
    pub fn spawn_lock_cleanup(&self) -> JoinHandle<()> {
        let lock_manager = self.lock_manager.clone();
        tokio::spawn(async move { lock_manager.run_cleanup_loop().await })
    }

    fn default_deadline(&self) -> Deadline {
        Deadline::after(self.config.lock_config.acquisition_timeout)
    }

    /// Credit `amount` to `account`.
    pub async fn credit(
        &self,
        account: AccountId,
        amount: Decimal,
    ) -> LedgerResult<TransactionRecord> {
        self.credit_with_deadline(account, amount, self.default_deadline())
            .await
    }

    pub async fn credit_with_deadline(
        &self,
        account: AccountId,
        amount: Decimal,
        deadline: Deadline,
    ) -> LedgerResult<TransactionRecord> {
        let intent = self.screen(NewTransaction::credit(account, amount))?;
        self.submit(intent, deadline).await
    }

    /// Debit `amount` from `account`, subject to the overdraft policy.
    pub async fn debit(
        &self,
        account: AccountId,
        amount: Decimal,
    ) -> LedgerResult<TransactionRecord> {
        self.debit_with_deadline(account, amount, self.default_deadline())
            .await
    }

    pub async fn debit_with_deadline(
        &self,
        account: AccountId,
        amount: Decimal,
        deadline: Deadline,
    ) -> LedgerResult<TransactionRecord> {
        let intent = self.screen(NewTransaction::debit(account, amount))?;
        self.submit(intent, deadline).await
    }

    /// Move `amount` from `from` to `to`.
    ///
    /// Both legs apply and the record is Completed, or neither applies and
    /// the record is Failed.
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> LedgerResult<TransactionRecord> {
        self.transfer_with_deadline(from, to, amount, self.default_deadline())
            .await
    }

    pub async fn transfer_with_deadline(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        deadline: Deadline,
    ) -> LedgerResult<TransactionRecord> {
        let intent = self.screen(NewTransaction::transfer(from, to, amount))?;
        self.submit(intent, deadline).await
    }

    fn screen(&self, intent: Result<NewTransaction>) -> Result<NewTransaction> {
        intent.map_err(|err| {
            self.metrics.operation_rejected();
            warn!(error = %err, code = err.error_code(), "Operation rejected");
            err
        })
    }

    /// Execute a validated intent.
    ///
    /// `deadline` bounds the wait for account locks only. Once the locks are
    /// held the operation runs to a terminal status on its own task, even if
    /// the returned future is dropped.
    #[instrument(
        skip(self, intent, deadline),
        fields(
            kind = %intent.kind,
            from = %intent.from_account,
            to = ?intent.to_account.map(|a| a.value()),
            amount = %intent.amount
        )
    )]
    pub async fn submit(
        &self,
        intent: NewTransaction,
        deadline: Deadline,
    ) -> LedgerResult<TransactionRecord> {
        let locks = self.lock_manager.acquire(&intent.accounts(), deadline).await?;

        let execution = Execution {
            balances: self.balances.clone(),
            journal: self.journal.clone(),
            metrics: self.metrics.clone(),
            overdraft: self.config.overdraft,
            finalize: self.config.finalize_config.clone(),
        };

        let task = tokio::spawn(
            async move {
                let result = execution.run(intent).await;
                drop(locks);
                result
            }
            .in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => Err(LedgerError::StorageFailure(format!(
                "execution task aborted: {}",
                err
            ))),
        }
    }

    /// Get the current balance of `account`.
    pub async fn get_balance(&self, account: AccountId) -> LedgerResult<AccountBalance> {
        self.balances
            .read(account)
            .await?
            .ok_or(LedgerError::AccountNotFound(account))
    }

    /// Get a transaction record by id.
    pub async fn get_transaction(&self, id: TransactionId) -> LedgerResult<TransactionRecord> {
        self.journal
            .get(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    /// Snapshot of every record where `account` is source or destination,
    /// in creation order.
    pub async fn get_history(&self, account: AccountId) -> LedgerResult<TransactionHistory> {
        let records = self.journal.query_by_account(account).await?;
        Ok(TransactionHistory::new(account, records))
    }

    /// Compare the stored balance of `account` with a replay of its history.
    ///
    /// Holds the account lock while reading so no mutation interleaves.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn verify_account(&self, account: AccountId) -> LedgerResult<BalanceCheck> {
        let _locks = self
            .lock_manager
            .acquire(&[account], self.default_deadline())
            .await?;

        let stored = self
            .balances
            .read(account)
            .await?
            .map(|b| b.amount)
            .unwrap_or(Decimal::ZERO);
        let replayed = self.get_history(account).await?.replayed_balance();

        let check = BalanceCheck {
            account,
            stored,
            replayed,
        };
        if !check.is_consistent() {
            error!(
                account = %account,
                stored = %stored,
                replayed = %replayed,
                "Balance does not match transaction history"
            );
        }
        Ok(check)
    }
}

/// Everything an operation needs once its locks are held.
struct Execution {
    balances: Arc<dyn BalanceStore>,
    journal: Arc<dyn TransactionLog>,
    metrics: Arc<EngineMetrics>,
    overdraft: OverdraftPolicy,
    finalize: FinalizeConfig,
}

impl Execution {
    async fn run(self, intent: NewTransaction) -> Result<TransactionRecord> {
        self.metrics.operation_started();

        let record = match self.journal.append(intent).await {
            Ok(record) => record,
            Err(err) => {
                self.metrics.operation_failed();
                error!(error = %err, "Failed to append transaction record");
                return Err(err);
            }
        };
        debug!(transaction_id = %record.id, "Pending record appended");

        let applied = match AssertUnwindSafe(self.apply(&record)).catch_unwind().await {
            Ok(applied) => applied,
            Err(payload) => {
                self.metrics.operation_failed();
                error!(
                    transaction_id = %record.id,
                    "Execution panicked, balances must be verified"
                );
                if let Err(err) = self.finalize(record.id, TransactionStatus::Failed).await {
                    self.metrics.unrecoverable_state();
                    error!(
                        transaction_id = %record.id,
                        error = %err,
                        "Terminal status could not be recorded"
                    );
                }
                panic::resume_unwind(payload);
            }
        };
        let status = match applied {
            Ok(()) => TransactionStatus::Completed,
            Err(_) => TransactionStatus::Failed,
        };
        let finalized = self.finalize(record.id, status).await;

        match (applied, finalized) {
            (Ok(()), Ok(done)) => {
                self.metrics.operation_completed();
                info!(
                    transaction_id = %done.id,
                    kind = %done.kind,
                    amount = %done.amount,
                    status = %done.status,
                    "Transaction completed"
                );
                Ok(done)
            }
            (Err(err), Ok(failed)) => {
                self.metrics.operation_failed();
                if err.requires_reconciliation() {
                    self.metrics.unrecoverable_state();
                    error!(
                        transaction_id = %failed.id,
                        error = %err,
                        "Transaction failed and needs reconciliation"
                    );
                } else {
                    warn!(
                        transaction_id = %failed.id,
                        status = %failed.status,
                        error = %err,
                        code = err.error_code(),
                        "Transaction failed"
                    );
                }
                Err(err)
            }
            (applied, Err(unrecorded)) => {
                self.metrics.operation_failed();
                self.metrics.unrecoverable_state();
                error!(
                    transaction_id = %record.id,
                    error = %unrecorded,
                    "Terminal status could not be recorded"
                );
                match applied {
                    Err(err) if err.requires_reconciliation() => Err(err),
                    _ => Err(unrecorded),
                }
            }
        }
    }

    async fn apply(&self, record: &TransactionRecord) -> Result<()> {
        match (record.kind, record.to_account) {
            (TransactionKind::Credit, _) => {
                self.credit_leg(record.from_account, record.amount).await?;
                Ok(())
            }
            (TransactionKind::Debit, _) => {
                self.debit_leg(record.from_account, record.amount).await?;
                Ok(())
            }
            (TransactionKind::Transfer, Some(to)) => self.transfer_legs(record, to).await,
            (TransactionKind::Transfer, None) => Err(LedgerError::StorageFailure(format!(
                "transfer {} has no destination account",
                record.id
            ))),
        }
    }

    async fn current_amount(&self, account: AccountId) -> Result<(Decimal, bool)> {
        Ok(match self.balances.read(account).await? {
            Some(balance) => (balance.amount, true),
            None => (Decimal::ZERO, false),
        })
    }

    async fn credit_leg(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance> {
        let (current, exists) = self.current_amount(account).await?;
        let updated = storable(account, current.checked_add(amount))?;
        let balance = self.balances.write(account, updated).await?;
        log_balance_write(&balance, exists);
        Ok(balance)
    }

    async fn debit_leg(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance> {
        let (current, exists) = self.current_amount(account).await?;
        let updated = current
            .checked_sub(amount)
            .ok_or(LedgerError::BalanceOutOfRange(account))?;

        if !self.overdraft.permits(updated) {
            return Err(LedgerError::InsufficientFunds {
                account,
                required: amount,
                available: self.overdraft.available(current),
            });
        }

        let updated = storable(account, Some(updated))?;
        let balance = self.balances.write(account, updated).await?;
        log_balance_write(&balance, exists);
        Ok(balance)
    }

    async fn transfer_legs(&self, record: &TransactionRecord, to: AccountId) -> Result<()> {
        let from = record.from_account;
        let debited = self.debit_leg(from, record.amount).await?;

        let credit_error = match self.credit_leg(to, record.amount).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        warn!(
            transaction_id = %record.id,
            account = %from,
            error = %credit_error,
            "Credit leg failed, reversing debit"
        );
        self.metrics.compensation();

        // The lock on `from` is still held, so its value is exactly what the
        // debit leg wrote.
        let compensation = match storable(from, debited.amount.checked_add(record.amount)) {
            Ok(restored) => self.balances.write(from, restored).await,
            Err(err) => Err(err),
        };
        match compensation {
            Ok(_) => Err(credit_error),
            Err(compensation_error) => Err(LedgerError::UnrecoverableState {
                transaction_id: record.id,
                reason: format!(
                    "credit to account {} failed ({}), then restoring account {} failed ({})",
                    to, credit_error, from, compensation_error
                ),
            }),
        }
    }

    /// Record a terminal status, retrying with doubling backoff.
    async fn finalize(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        let mut backoff = self.finalize.backoff;
        let mut last_error = None;

        for attempt in 1..=self.finalize.attempts {
            match self.journal.update_status(id, status).await {
                Ok(record) => return Ok(record),
                // An earlier attempt may have landed without us seeing the reply.
                Err(LedgerError::InvalidTransition { from, .. }) if from == status => {
                    if let Ok(Some(record)) = self.journal.get(id).await {
                        return Ok(record);
                    }
                    last_error = Some(LedgerError::InvalidTransition { from, to: status });
                }
                Err(err) => {
                    warn!(
                        transaction_id = %id,
                        attempt,
                        error = %err,
                        "Failed to record terminal status"
                    );
                    last_error = Some(err);
                }
            }

            if attempt < self.finalize.attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        let reason = match last_error {
            Some(err) => format!("could not mark record {}: {}", status, err),
            None => format!("could not mark record {}", status),
        };
        Err(LedgerError::UnrecoverableState {
            transaction_id: id,
            reason,
        })
    }
}

/// A balance produced by a leg, if it did not overflow and fits the
/// persisted range.
fn storable(account: AccountId, balance: Option<Decimal>) -> Result<Decimal> {
    balance
        .filter(|b| is_storable(*b))
        .ok_or(LedgerError::BalanceOutOfRange(account))
}

fn log_balance_write(balance: &AccountBalance, existed: bool) {
    if existed {
        debug!(
            account = %balance.account_id,
            balance = %format_amount(balance.amount),
            "Balance updated"
        );
    } else {
        info!(
            account = %balance.account_id,
            balance = %format_amount(balance.amount),
            "Balance created"
        );
    }
}
