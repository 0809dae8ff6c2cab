//! Ledger configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_common::{constants, parse_amount, LedgerError, Result, MAX_AMOUNT};

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an operation waits for its account locks by default.
    pub acquisition_timeout: Duration,
    /// Idle lock cleanup interval.
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout: constants::LOCK_ACQUISITION_TIMEOUT,
            cleanup_interval: constants::LOCK_CLEANUP_INTERVAL,
        }
    }
}

/// Rule governing whether a debit may drive a balance negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdraftPolicy {
    /// Reject any mutation producing a negative balance.
    #[default]
    Forbid,
    /// Allow balances down to `-limit`.
    Limit(Decimal),
}

impl OverdraftPolicy {
    /// Check if a balance may be stored under this policy.
    pub fn permits(&self, balance: Decimal) -> bool {
        match self {
            OverdraftPolicy::Forbid => balance >= Decimal::ZERO,
            OverdraftPolicy::Limit(limit) => balance >= -*limit,
        }
    }

    /// Largest amount that may be debited from `balance`.
    pub fn available(&self, balance: Decimal) -> Decimal {
        let floor = match self {
            OverdraftPolicy::Forbid => Decimal::ZERO,
            OverdraftPolicy::Limit(limit) => -*limit,
        };
        balance
            .checked_sub(floor)
            .unwrap_or(Decimal::MAX)
            .max(Decimal::ZERO)
    }
}

/// Terminal status recording configuration.
#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    /// Attempts made to write a terminal status.
    pub attempts: usize,
    /// Backoff before the second attempt, doubled for each one after.
    pub backoff: Duration,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            attempts: constants::FINALIZE_ATTEMPTS,
            backoff: constants::FINALIZE_BACKOFF,
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// PostgreSQL URL. In-memory stores are used when absent.
    pub database_url: Option<String>,
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Overdraft policy applied to every debit leg.
    pub overdraft: OverdraftPolicy,
    /// Terminal status recording configuration.
    pub finalize_config: FinalizeConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lock_config: LockConfig::default(),
            overdraft: OverdraftPolicy::default(),
            finalize_config: FinalizeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.is_empty()) {
            config.database_url = Some(url);
        }

        if let Some(ms) = lookup("LEDGER_LOCK_TIMEOUT_MS") {
            config.lock_config.acquisition_timeout =
                Duration::from_millis(parse_number("LEDGER_LOCK_TIMEOUT_MS", &ms)?);
        }

        if let Some(ms) = lookup("LEDGER_LOCK_CLEANUP_MS") {
            config.lock_config.cleanup_interval =
                Duration::from_millis(parse_number("LEDGER_LOCK_CLEANUP_MS", &ms)?);
        }

        if let Some(limit) = lookup("LEDGER_OVERDRAFT_LIMIT") {
            let limit = parse_amount(&limit).map_err(|e| {
                LedgerError::Configuration(format!("LEDGER_OVERDRAFT_LIMIT: {}", e))
            })?;
            config.overdraft = if limit.is_zero() {
                OverdraftPolicy::Forbid
            } else {
                OverdraftPolicy::Limit(limit)
            };
        }

        if let Some(attempts) = lookup("LEDGER_FINALIZE_ATTEMPTS") {
            config.finalize_config.attempts =
                parse_number("LEDGER_FINALIZE_ATTEMPTS", &attempts)? as usize;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lock_config.acquisition_timeout.is_zero() {
            return Err(LedgerError::Configuration(
                "Lock acquisition timeout cannot be 0".to_string(),
            ));
        }

        if self.lock_config.cleanup_interval.is_zero() {
            return Err(LedgerError::Configuration(
                "Lock cleanup interval cannot be 0".to_string(),
            ));
        }

        if let OverdraftPolicy::Limit(limit) = self.overdraft {
            if limit < Decimal::ZERO {
                return Err(LedgerError::Configuration(
                    "Overdraft limit cannot be negative".to_string(),
                ));
            }
            if limit > MAX_AMOUNT {
                return Err(LedgerError::Configuration(format!(
                    "Overdraft limit cannot exceed {}",
                    MAX_AMOUNT
                )));
            }
        }

        if self.finalize_config.attempts == 0 {
            return Err(LedgerError::Configuration(
                "Finalize attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| LedgerError::Configuration(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overdraft, OverdraftPolicy::Forbid);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/tally"),
            ("LEDGER_LOCK_TIMEOUT_MS", "250"),
            ("LEDGER_OVERDRAFT_LIMIT", "50.00"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/tally")
        );
        assert_eq!(
            config.lock_config.acquisition_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.overdraft, OverdraftPolicy::Limit(Decimal::from(50)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            LedgerConfig::from_lookup(lookup(&[("LEDGER_LOCK_TIMEOUT_MS", "soon")])),
            Err(LedgerError::Configuration(_))
        ));
        assert!(matches!(
            LedgerConfig::from_lookup(lookup(&[("LEDGER_LOCK_TIMEOUT_MS", "0")])),
            Err(LedgerError::Configuration(_))
        ));

        let mut config = LedgerConfig::default();
        config.overdraft = OverdraftPolicy::Limit(Decimal::from(-5));
        assert!(config.validate().is_err());
        config.overdraft = OverdraftPolicy::Limit(Decimal::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overdraft_policy() {
        let forbid = OverdraftPolicy::Forbid;
        assert!(forbid.permits(Decimal::ZERO));
        assert!(!forbid.permits(Decimal::new(-1, 2)));
        assert_eq!(forbid.available(Decimal::from(100)), Decimal::from(100));
        assert_eq!(forbid.available(Decimal::from(-3)), Decimal::ZERO);

        let limit = OverdraftPolicy::Limit(Decimal::from(50));
        assert!(limit.permits(Decimal::from(-50)));
        assert!(!limit.permits(Decimal::from(-51)));
        assert_eq!(limit.available(Decimal::from(10)), Decimal::from(60));

        let unbounded = OverdraftPolicy::Limit(Decimal::MAX);
        assert_eq!(unbounded.available(Decimal::ONE), Decimal::MAX);
    }
}
