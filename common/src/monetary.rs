//! Monetary amounts.
//!
//! Amounts are fixed-point `Decimal` values. Binary floating point never
//! appears in balances or transaction records.

use rust_decimal::Decimal;

use crate::error::{LedgerError, Result};

/// Number of fractional digits the ledger persists for an amount.
pub const AMOUNT_SCALE: u32 = 4;

/// Largest magnitude an amount or balance may have: 9999999999999999.9999,
/// the range of a `NUMERIC(20,4)` column.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_661_992_959, 1_808_227_885, 5, false, 4);

/// Parse an amount from its decimal string form.
pub fn parse_amount(value: &str) -> std::result::Result<Decimal, rust_decimal::Error> {
    value.trim().parse()
}

/// Check that an amount can be used as a transaction amount.
///
/// The amount must be strictly positive, no larger than [`MAX_AMOUNT`] and
/// representable with [`AMOUNT_SCALE`] fractional digits, so persisting it
/// never rounds.
pub fn ensure_valid_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO || amount > MAX_AMOUNT {
        return Err(LedgerError::InvalidAmount(amount));
    }
    let normalized = amount.normalize();
    if normalized.scale() > AMOUNT_SCALE {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(normalized)
}

/// Check if a balance fits the persisted range.
pub fn is_storable(balance: Decimal) -> bool {
    balance.abs() <= MAX_AMOUNT
}

/// Format an amount with at least two fractional digits.
pub fn format_amount(amount: Decimal) -> String {
    let normalized = amount.normalize();
    if normalized.scale() < 2 {
        let mut padded = normalized;
        padded.rescale(2);
        padded.to_string()
    } else {
        normalized.to_string()
    }
}
