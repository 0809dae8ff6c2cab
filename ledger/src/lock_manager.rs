//! Per-account lock management.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use tally_common::{AccountId, Deadline, LedgerError, Result};

use crate::config::LockConfig;
use crate::metrics::EngineMetrics;

/// Exclusive access to a set of accounts.
///
/// Guards are held in acquisition (ascending id) order and released in
/// reverse order when the value is dropped.
#[derive(Debug)]
pub struct AccountLocks {
    guards: Vec<(AccountId, OwnedMutexGuard<()>)>,
}

impl AccountLocks {
    /// Accounts held, in acquisition order.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.guards.iter().map(|(account, _)| *account).collect()
    }

    /// Check if `account` is held.
    pub fn holds(&self, account: AccountId) -> bool {
        self.guards.iter().any(|(held, _)| *held == account)
    }
}

impl Drop for AccountLocks {
    fn drop(&mut self) {
        while let Some((account, guard)) = self.guards.pop() {
            drop(guard);
            debug!(account = %account, "Account lock released");
        }
    }
}

/// Manager for per-account locks.
///
/// Each account maps to a FIFO-fair async mutex, so waiters on the same
/// account are served in arrival order. Operations on disjoint accounts never
/// contend.
pub struct AccountLockManager {
    /// Lock per account that has been touched since the last sweep.
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    /// Configuration.
    config: LockConfig,
    /// Shared engine metrics.
    metrics: Arc<EngineMetrics>,
}

impl AccountLockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            locks: DashMap::new(),
            config,
            metrics,
        }
    }

    /// Lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire every account in `accounts`.
    ///
    /// Accounts are locked in ascending id order regardless of the order
    /// given. If `deadline` elapses first, or the returned future is dropped,
    /// every lock taken so far is released.
    pub async fn acquire(
        &self,
        accounts: &[AccountId],
        deadline: Deadline,
    ) -> Result<AccountLocks> {
        let mut ordered = accounts.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut held = AccountLocks {
            guards: Vec::with_capacity(ordered.len()),
        };

        for account in ordered {
            let lock = self.lock_for(account);
            let wait = tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline.instant()),
                lock.lock_owned(),
            );

            match wait.await {
                Ok(guard) => {
                    debug!(
                        account = %account,
                        remaining_ms = deadline.remaining().as_millis() as u64,
                        "Account lock acquired"
                    );
                    held.guards.push((account, guard));
                }
                Err(_) => {
                    self.metrics.lock_timeout();
                    warn!(
                        account = %account,
                        held = held.guards.len(),
                        "Lock acquisition deadline elapsed"
                    );
                    return Err(LedgerError::Timeout(format!(
                        "waiting for lock on account {}",
                        account
                    )));
                }
            }
        }

        self.metrics.lock_acquired();
        Ok(held)
    }

    /// Number of accounts with a tracked lock.
    pub fn tracked_count(&self) -> usize {
        self.locks.len()
    }

    /// Number of accounts currently locked.
    pub fn held_count(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().try_lock().is_err())
            .count()
    }

    /// Run cleanup loop to drop idle locks.
    pub async fn run_cleanup_loop(&self) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            self.prune_idle();
        }
    }

    /// Drop locks that nobody holds or waits on. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // The map entry is the only reference when no guard or waiter exists.
        // New waiters clone the Arc under the same shard lock, so they either
        // see the old entry or insert a fresh one.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let pruned = before.saturating_sub(self.locks.len());
        if pruned > 0 {
            debug!(pruned, "Idle account locks pruned");
        }
        pruned
    }

    fn lock_for(&self, account: AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
