//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Coordinator metrics.
pub struct Metrics {
    /// Operations invoked through the coordinator.
    pub operations_invoked: AtomicU64,
    /// Operations admitted by the precondition engine.
    pub operations_admitted: AtomicU64,
    /// Operations rejected by the precondition engine.
    pub operations_rejected: AtomicU64,
    /// Operations that completed successfully.
    pub operations_succeeded: AtomicU64,
    /// Operations that failed after admission.
    pub operations_failed: AtomicU64,
    /// Operations currently running.
    pub operations_active: AtomicU64,
    /// Rollbacks performed.
    pub rollbacks: AtomicU64,
    /// Mutating operations refused because the cluster was locked.
    pub lock_conflicts: AtomicU64,
    /// Seed list updates that did not reach every member.
    pub seed_propagation_partial_failures: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            operations_invoked: AtomicU64::new(0),
            operations_admitted: AtomicU64::new(0),
            operations_rejected: AtomicU64::new(0),
            operations_succeeded: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_active: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
            seed_propagation_partial_failures: AtomicU64::new(0),
        }
    }

    /// Record an invocation.
    pub fn operation_invoked(&self) {
        self.operations_invoked.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admission.
    pub fn operation_admitted(&self) {
        self.operations_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a precondition rejection.
    pub fn operation_rejected(&self) {
        self.operations_rejected.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record operation success.
    pub fn operation_succeeded(&self) {
        self.operations_succeeded.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record operation failure.
    pub fn operation_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
        self.operations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a rollback.
    pub fn rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lock conflict.
    pub fn lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a partial seed propagation.
    pub fn seed_propagation_partial_failure(&self) {
        self.seed_propagation_partial_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_invoked: self.operations_invoked.load(Ordering::Relaxed),
            operations_admitted: self.operations_admitted.load(Ordering::Relaxed),
            operations_rejected: self.operations_rejected.load(Ordering::Relaxed),
            operations_succeeded: self.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operations_active: self.operations_active.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            seed_propagation_partial_failures: self
                .seed_propagation_partial_failures
                .load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations_invoked: u64,
    pub operations_admitted: u64,
    pub operations_rejected: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_active: u64,
    pub rollbacks: u64,
    pub lock_conflicts: u64,
    pub seed_propagation_partial_failures: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.operation_invoked();
        metrics.operation_invoked();
        metrics.operation_admitted();
        metrics.operation_succeeded();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_invoked, 2);
        assert_eq!(snapshot.operations_succeeded, 1);
        assert_eq!(snapshot.operations_active, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.operation_invoked();
        metrics.operation_rejected();
        metrics.lock_conflict();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["operations_rejected"], 1);
        assert_eq!(json["lock_conflicts"], 1);
        assert_eq!(json["operations_active"], 0);
    }
}
