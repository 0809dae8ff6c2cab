//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A scripted simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Amounts are decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    Credit { account: i64, amount: String },
    Debit { account: i64, amount: String },
    Transfer { from: i64, to: i64, amount: String },
    /// Run the inner steps concurrently.
    Burst { steps: Vec<ScenarioStep> },
    /// Pause between steps.
    Wait { millis: u64 },
    /// Check a condition; the scenario stops if it does not hold.
    Assert { condition: AssertCondition },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Account balance equals.
    BalanceEquals { account: i64, amount: String },
    /// The previous operation step succeeded (`None`) or failed with the code.
    LastOutcome { error_code: Option<String> },
    /// Stored balance matches the replayed history.
    Consistent { account: i64 },
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 3] = ["example", "overdraft", "contention"];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "example" => Ok(Self::example()),
            "overdraft" => Ok(Self::overdraft()),
            "contention" => Ok(Self::contention()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Debit refusal, a transfer and a credit on two accounts.
    fn example() -> Self {
        Self {
            name: "example".to_string(),
            description: "Rejected debit, transfer, then credit".to_string(),
            steps: vec![
                credit(1, "100.00"),
                balance(1, "100.00"),
                debit(1, "150.00"),
                outcome(Some("INSUFFICIENT_FUNDS")),
                balance(1, "100.00"),
                transfer(1, 2, "40.00"),
                outcome(None),
                balance(1, "60.00"),
                balance(2, "40.00"),
                credit(2, "10.00"),
                balance(2, "50.00"),
                consistent(1),
                consistent(2),
            ],
        }
    }

    /// Every debit path refuses to overdraw.
    fn overdraft() -> Self {
        Self {
            name: "overdraft".to_string(),
            description: "Debits and transfers beyond the balance are refused".to_string(),
            steps: vec![
                credit(1, "50.00"),
                debit(1, "30.00"),
                outcome(None),
                debit(1, "30.00"),
                outcome(Some("INSUFFICIENT_FUNDS")),
                transfer(1, 2, "25.00"),
                outcome(Some("INSUFFICIENT_FUNDS")),
                balance(1, "20.00"),
                transfer(1, 1, "1.00"),
                outcome(Some("SAME_ACCOUNT_TRANSFER")),
                debit(2, "-5"),
                outcome(Some("INVALID_AMOUNT")),
                consistent(1),
                consistent(2),
            ],
        }
    }

    /// Opposite-direction transfers racing on the same pair of accounts.
    fn contention() -> Self {
        let transfers = (0..50)
            .map(|i| {
                if i % 2 == 0 {
                    transfer(1, 2, "10.00")
                } else {
                    transfer(2, 1, "10.00")
                }
            })
            .collect();

        Self {
            name: "contention".to_string(),
            description: "Concurrent opposite transfers between two accounts".to_string(),
            steps: vec![
                credit(1, "1000.00"),
                credit(2, "1000.00"),
                ScenarioStep::Burst { steps: transfers },
                ScenarioStep::Wait { millis: 10 },
                balance(1, "1000.00"),
                balance(2, "1000.00"),
                consistent(1),
                consistent(2),
            ],
        }
    }
}

fn credit(account: i64, amount: &str) -> ScenarioStep {
    ScenarioStep::Credit {
        account,
        amount: amount.to_string(),
    }
}

fn debit(account: i64, amount: &str) -> ScenarioStep {
    ScenarioStep::Debit {
        account,
        amount: amount.to_string(),
    }
}

fn transfer(from: i64, to: i64, amount: &str) -> ScenarioStep {
    ScenarioStep::Transfer {
        from,
        to,
        amount: amount.to_string(),
    }
}

fn balance(account: i64, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            account,
            amount: amount.to_string(),
        },
    }
}

fn outcome(error_code: Option<&str>) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastOutcome {
            error_code: error_code.map(str::to_string),
        },
    }
}

fn consistent(account: i64) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::Consistent { account },
    }
}
