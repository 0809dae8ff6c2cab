//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

/// Client-side view of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Operations submitted.
    pub total_operations: u64,
    /// Operations that returned a Completed record.
    pub successful_operations: u64,
    /// Operations that returned an error.
    pub failed_operations: u64,
    /// Failures by error code.
    pub failures_by_code: BTreeMap<&'static str, u64>,
    /// Latency samples (µs).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            failures_by_code: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self, latency_us: u64) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.push_sample(latency_us);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, code: &'static str, latency_us: u64) {
        self.total_operations += 1;
        self.failed_operations += 1;
        *self.failures_by_code.entry(code).or_insert(0) += 1;
        self.push_sample(latency_us);
    }

    fn push_sample(&mut self, latency_us: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Operations per second over `elapsed`.
    pub fn throughput(&self, elapsed: std::time::Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.total_operations as f64 / secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
