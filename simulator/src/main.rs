//! Tally Simulator
//!
//! Drives the ledger engine through scripted scenarios or a seeded random
//! workload, then checks every touched account against its history.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;
use tally_common::parse_amount;
use tally_ledger::{LedgerConfig, LedgerEngine, OverdraftPolicy};

/// Tally Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "tally-simulator")]
#[command(about = "Workload simulator for the Tally ledger engine")]
struct Args {
    /// Scripted scenario to run (example, overdraft, contention)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Number of accounts in the random workload
    #[arg(short, long, default_value = "10")]
    accounts: usize,

    /// Number of random operations
    #[arg(short, long, default_value = "1000")]
    operations: usize,

    /// Operations in flight at once
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL URL; overrides DATABASE_URL. In-memory storage when unset.
    #[arg(long)]
    database_url: Option<String>,

    /// Allow balances down to minus this amount
    #[arg(long)]
    overdraft_limit: Option<String>,

    /// Emit JSON logs and a JSON report
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LedgerConfig::from_env()?;
    if let Some(url) = args.database_url.clone() {
        config.database_url = Some(url);
    }
    if let Some(limit) = &args.overdraft_limit {
        config.overdraft = OverdraftPolicy::Limit(parse_amount(limit)?);
    }

    // Initialize logging
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("Starting Tally Simulator");

    let engine = Arc::new(LedgerEngine::from_config(config).await?);
    let cleanup = engine.spawn_lock_cleanup();

    let mut controller = SimulationController::new(engine.clone(), args.seed);
    info!(run_id = %controller.run_id(), "Simulator initialized");

    match &args.scenario {
        Some(name) => {
            let scenario = Scenario::load(name)?;
            controller.run_scenario(scenario).await?;
        }
        None => {
            controller
                .run_random(args.accounts, args.operations, args.concurrency)
                .await?;
        }
    }

    let report = controller.report().await?;
    cleanup.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let metrics = controller.metrics();
        info!("Simulation complete");
        info!("Total operations: {}", metrics.total_operations);
        info!("Successful: {}", metrics.successful_operations);
        info!("Failed: {}", metrics.failed_operations);
        for (code, count) in &metrics.failures_by_code {
            info!("  {}: {}", code, count);
        }
        info!("Average latency: {}µs", metrics.average_latency_us());
        info!(
            "p50 / p99 latency: {}µs / {}µs",
            report.p50_latency_us, report.p99_latency_us
        );
        info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
        info!("Throughput: {:.0} ops/s", report.throughput_per_sec);
        info!("Accounts verified: {}", report.accounts.len());
        println!("{}", engine.metrics().to_prometheus());
    }

    if report.engine.unrecoverable > 0 {
        warn!(
            unrecoverable = report.engine.unrecoverable,
            "Some operations need manual reconciliation"
        );
    }

    Ok(())
}
