//! Tally Common Types
//!
//! Shared types for the Tally ledger: account and transaction identifiers,
//! monetary helpers, transaction records with their status state machine,
//! and the ledger error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use error::*;
pub use time::*;
