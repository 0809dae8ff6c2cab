//! Storage backends.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryBalanceStore, MemoryTransactionLog};
pub use postgres::{PgBalanceStore, PgTransactionLog};
