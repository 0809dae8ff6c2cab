//! Metrics collection for engine monitoring.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine metrics.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Mutating operations that passed validation.
    pub operations_total: AtomicU64,
    /// Operations currently holding their locks.
    pub operations_active: AtomicU64,
    /// Operations that finished Completed.
    pub operations_completed: AtomicU64,
    /// Operations that finished Failed.
    pub operations_failed: AtomicU64,
    /// Operations rejected by validation.
    pub operations_rejected: AtomicU64,
    /// Successful lock set acquisitions.
    pub locks_acquired: AtomicU64,
    /// Lock acquisitions abandoned at the deadline.
    pub locks_timeout: AtomicU64,
    /// Transfer debit legs reversed after a credit leg failure.
    pub compensations: AtomicU64,
    /// Operations that ended needing manual reconciliation.
    pub unrecoverable: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            operations_total: AtomicU64::new(0),
            operations_active: AtomicU64::new(0),
            operations_completed: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_rejected: AtomicU64::new(0),
            locks_acquired: AtomicU64::new(0),
            locks_timeout: AtomicU64::new(0),
            compensations: AtomicU64::new(0),
            unrecoverable: AtomicU64::new(0),
        }
    }

    /// Record an operation entering execution.
    pub fn operation_started(&self) {
        self.operations_total.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an operation finishing Completed.
    pub fn operation_completed(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an operation finishing Failed, or ending without a record.
    pub fn operation_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a validation rejection.
    pub fn operation_rejected(&self) {
        self.operations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lock set acquisition.
    pub fn lock_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lock timeout.
    pub fn lock_timeout(&self) {
        self.locks_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compensating write.
    pub fn compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unrecoverable outcome.
    pub fn unrecoverable_state(&self) {
        self.unrecoverable.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_total: self.operations_total.load(Ordering::Relaxed),
            operations_active: self.operations_active.load(Ordering::Relaxed),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operations_rejected: self.operations_rejected.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_timeout: self.locks_timeout.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            unrecoverable: self.unrecoverable.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let series = [
            ("operations_total", "counter", "Mutating operations executed", snapshot.operations_total),
            ("operations_active", "gauge", "Operations currently executing", snapshot.operations_active),
            ("operations_completed", "counter", "Operations finished Completed", snapshot.operations_completed),
            ("operations_failed", "counter", "Operations finished Failed", snapshot.operations_failed),
            ("operations_rejected", "counter", "Operations rejected by validation", snapshot.operations_rejected),
            ("locks_acquired", "counter", "Lock sets acquired", snapshot.locks_acquired),
            ("locks_timeout", "counter", "Lock acquisitions timed out", snapshot.locks_timeout),
            ("compensations", "counter", "Transfer debit legs reversed", snapshot.compensations),
            ("unrecoverable", "counter", "Operations needing reconciliation", snapshot.unrecoverable),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP tally_{} {}", name, help);
            let _ = writeln!(out, "# TYPE tally_{} {}", name, kind);
            let _ = writeln!(out, "tally_{} {}", name, value);
        }
        out
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations_total: u64,
    pub operations_active: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub operations_rejected: u64,
    pub locks_acquired: u64,
    pub locks_timeout: u64,
    pub compensations: u64,
    pub unrecoverable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = EngineMetrics::new();

        metrics.operation_started();
        metrics.operation_started();
        metrics.operation_completed();
        metrics.operation_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_total, 2);
        assert_eq!(snapshot.operations_completed, 1);
        assert_eq!(snapshot.operations_active, 1);
        assert_eq!(snapshot.operations_rejected, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = EngineMetrics::new();
        metrics.operation_started();
        metrics.compensation();

        let output = metrics.to_prometheus();
        assert!(output.contains("tally_operations_total 1"));
        assert!(output.contains("tally_compensations 1"));
        assert!(output.contains("# TYPE tally_operations_active gauge"));
    }
}
