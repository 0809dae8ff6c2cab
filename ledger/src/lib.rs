//! Tally Ledger Engine
//!
//! Account balances and their transaction log, mutated through credits,
//! debits and transfers that are serialized per account and always end in a
//! terminal transaction status.

pub mod engine;
pub mod balance;
pub mod journal;
pub mod lock_manager;
pub mod config;
pub mod metrics;
pub mod store;

pub use engine::{BalanceCheck, LedgerEngine};
pub use balance::{AccountBalance, BalanceStore};
pub use journal::{TransactionHistory, TransactionLog};
pub use lock_manager::{AccountLockManager, AccountLocks};
pub use config::{FinalizeConfig, LedgerConfig, LockConfig, OverdraftPolicy};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use store::{MemoryBalanceStore, MemoryTransactionLog, PgBalanceStore, PgTransactionLog};
