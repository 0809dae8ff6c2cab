//! Simulation controller.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_common::{
    format_amount, parse_amount, AccountId, LedgerResult, TransactionRecord,
};
use tally_ledger::{BalanceCheck, LedgerEngine, MetricsSnapshot};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Scenario, ScenarioStep};

/// Balance every account starts with in a random workload.
const INITIAL_BALANCE: Decimal = Decimal::from_parts(100_000, 0, 0, false, 2);

/// A balance-mutating request.
#[derive(Debug, Clone, Copy)]
enum Operation {
    Credit(AccountId, Decimal),
    Debit(AccountId, Decimal),
    Transfer(AccountId, AccountId, Decimal),
}

impl Operation {
    fn accounts(&self) -> Vec<AccountId> {
        match *self {
            Operation::Credit(account, _) | Operation::Debit(account, _) => vec![account],
            Operation::Transfer(from, to, _) => vec![from, to],
        }
    }

    async fn execute(self, engine: &LedgerEngine) -> (Duration, LedgerResult<TransactionRecord>) {
        let started = Instant::now();
        let result = match self {
            Operation::Credit(account, amount) => engine.credit(account, amount).await,
            Operation::Debit(account, amount) => engine.debit(account, amount).await,
            Operation::Transfer(from, to, amount) => engine.transfer(from, to, amount).await,
        };
        (started.elapsed(), result)
    }
}

/// Final summary of a run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub throughput_per_sec: f64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub client: SimulationMetrics,
    pub engine: MetricsSnapshot,
    pub accounts: Vec<BalanceCheck>,
}

/// Drives a ledger engine through scenarios and random workloads.
pub struct SimulationController {
    /// Identifies this run in logs and the report.
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    engine: Arc<LedgerEngine>,
    /// Random number generator.
    rng: StdRng,
    /// Simulation metrics.
    metrics: SimulationMetrics,
    /// Error code of the latest operation, `None` if it succeeded.
    last_outcome: Option<Option<&'static str>>,
    /// Accounts touched so far.
    accounts: BTreeSet<AccountId>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(engine: Arc<LedgerEngine>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            engine,
            rng,
            metrics: SimulationMetrics::new(),
            last_outcome: None,
            accounts: BTreeSet::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run a scenario, stopping at the first failed assertion.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!(
            run_id = %self.run_id,
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Running scenario: {}",
            scenario.description
        );

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("scenario {} step {}", scenario.name, index + 1))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Fund `accounts` accounts, then run `operations` random operations,
    /// `concurrency` at a time.
    pub async fn run_random(
        &mut self,
        accounts: usize,
        operations: usize,
        concurrency: usize,
    ) -> anyhow::Result<()> {
        if accounts == 0 {
            bail!("at least one account is required");
        }
        let concurrency = concurrency.max(1);
        info!(
            run_id = %self.run_id,
            accounts,
            operations,
            concurrency,
            "Running random workload"
        );

        let funding: Vec<_> = (1..=accounts as i64)
            .map(|id| Operation::Credit(AccountId::new(id), INITIAL_BALANCE))
            .collect();
        self.run_batch(funding).await;

        let plan: Vec<_> = (0..operations)
            .map(|_| self.random_operation(accounts))
            .collect();
        for batch in plan.chunks(concurrency) {
            self.run_batch(batch.to_vec()).await;
        }

        Ok(())
    }

    fn random_operation(&mut self, accounts: usize) -> Operation {
        let account = AccountId::new(self.rng.gen_range(1..=accounts as i64));
        let amount = Decimal::new(self.rng.gen_range(1..50_000), 2);

        match self.rng.gen_range(0..10) {
            0..=2 => Operation::Credit(account, amount),
            3..=5 => Operation::Debit(account, amount),
            _ if accounts < 2 => Operation::Debit(account, amount),
            _ => {
                let mut to = self.rng.gen_range(1..=accounts as i64);
                while to == account.value() {
                    to = self.rng.gen_range(1..=accounts as i64);
                }
                Operation::Transfer(account, AccountId::new(to), amount)
            }
        }
    }

    /// Execute operations concurrently and record their outcomes.
    async fn run_batch(&mut self, operations: Vec<Operation>) {
        let engine = self.engine.clone();
        let results = join_all(operations.iter().map(|op| op.execute(&engine))).await;

        for (operation, (latency, result)) in operations.iter().zip(results) {
            self.accounts.extend(operation.accounts());
            let latency_us = latency.as_micros() as u64;
            match result {
                Ok(_) => {
                    self.metrics.record_success(latency_us);
                    self.last_outcome = Some(None);
                }
                Err(err) => {
                    if err.requires_reconciliation() {
                        warn!(error = %err, "Operation left state needing reconciliation");
                    } else if !err.is_validation() {
                        debug!(code = err.error_code(), "Operation failed");
                    }
                    self.metrics.record_failure(err.error_code(), latency_us);
                    self.last_outcome = Some(Some(err.error_code()));
                }
            }
        }
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Burst { steps } => {
                let operations = steps
                    .iter()
                    .map(|inner| {
                        operation(inner)?.context("only operations may run inside a burst")
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                info!(operations = operations.len(), "Running burst");
                self.run_batch(operations).await;
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
            _ => {
                if let Some(operation) = operation(step)? {
                    self.run_batch(vec![operation]).await;
                }
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { account, amount } => {
                let expected = amount_of(amount)?;
                let actual = self.engine.get_balance(AccountId::new(*account)).await?.amount;
                if actual != expected {
                    bail!(
                        "balance of account {} is {}, expected {}",
                        account,
                        format_amount(actual),
                        format_amount(expected)
                    );
                }
            }
            AssertCondition::LastOutcome { error_code } => {
                let expected = error_code.as_deref();
                match self.last_outcome {
                    Some(actual) if actual == expected => {}
                    Some(actual) => bail!(
                        "last operation ended with {}, expected {}",
                        actual.unwrap_or("success"),
                        expected.unwrap_or("success")
                    ),
                    None => bail!("no operation has run yet"),
                }
            }
            AssertCondition::Consistent { account } => {
                let check = self.engine.verify_account(AccountId::new(*account)).await?;
                if !check.is_consistent() {
                    bail!(
                        "account {} stores {} but its history replays to {}",
                        account,
                        check.stored,
                        check.replayed
                    );
                }
            }
        }

        Ok(())
    }

    /// Verify every account touched during the run.
    pub async fn verify_accounts(&self) -> anyhow::Result<Vec<BalanceCheck>> {
        let mut checks = Vec::with_capacity(self.accounts.len());
        for account in &self.accounts {
            checks.push(self.engine.verify_account(*account).await?);
        }

        let inconsistent = checks.iter().filter(|c| !c.is_consistent()).count();
        if inconsistent > 0 {
            bail!("{} account(s) do not match their history", inconsistent);
        }
        Ok(checks)
    }

    /// Get simulation metrics.
    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }

    /// Build the final report.
    pub async fn report(&self) -> anyhow::Result<SimulationReport> {
        let accounts = self.verify_accounts().await?;
        let elapsed = self.started.elapsed();

        Ok(SimulationReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            throughput_per_sec: self.metrics.throughput(elapsed),
            p50_latency_us: self.metrics.p50_latency_us(),
            p99_latency_us: self.metrics.p99_latency_us(),
            client: self.metrics.clone(),
            engine: self.engine.metrics().snapshot(),
            accounts,
        })
    }
}

fn amount_of(value: &str) -> anyhow::Result<Decimal> {
    parse_amount(value).with_context(|| format!("invalid amount {:?}", value))
}

/// The operation a step describes, if it is one.
fn operation(step: &ScenarioStep) -> anyhow::Result<Option<Operation>> {
    Ok(match step {
        ScenarioStep::Credit { account, amount } => Some(Operation::Credit(
            AccountId::new(*account),
            amount_of(amount)?,
        )),
        ScenarioStep::Debit { account, amount } => Some(Operation::Debit(
            AccountId::new(*account),
            amount_of(amount)?,
        )),
        ScenarioStep::Transfer { from, to, amount } => Some(Operation::Transfer(
            AccountId::new(*from),
            AccountId::new(*to),
            amount_of(amount)?,
        )),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_ledger::LedgerConfig;

    fn controller(seed: u64) -> SimulationController {
        let engine = LedgerEngine::in_memory(LedgerConfig::default()).unwrap();
        SimulationController::new(Arc::new(engine), Some(seed))
    }

    #[tokio::test]
    async fn test_scenarios_pass() {
        for name in Scenario::NAMES {
            let mut controller = controller(1);
            controller
                .run_scenario(Scenario::load(name).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_random_workload_is_consistent() {
        let mut controller = controller(7);
        controller.run_random(5, 200, 8).await.unwrap();

        let report = controller.report().await.unwrap();
        assert_eq!(report.client.total_operations, 205);
        assert_eq!(report.engine.operations_active, 0);
        assert_eq!(report.accounts.len(), 5);
        assert!(report.accounts.iter().all(|c| c.is_consistent()));
    }

    #[tokio::test]
    async fn test_failed_assertion_stops_scenario() {
        let mut controller = controller(1);
        let scenario = Scenario {
            name: "broken".to_string(),
            description: "expects the wrong balance".to_string(),
            steps: vec![
                ScenarioStep::Credit {
                    account: 1,
                    amount: "5".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: 1,
                        amount: "6".to_string(),
                    },
                },
            ],
        };

        let err = controller.run_scenario(scenario).await.unwrap_err();
        assert!(format!("{:#}", err).contains("expected 6.00"));
    }
}
