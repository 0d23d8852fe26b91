//! Simulation metrics.

use std::collections::VecDeque;

use serde::Serialize;

/// Simulation metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Operations invoked.
    pub total_invocations: u64,
    /// Invocations that returned a report.
    pub successful_invocations: u64,
    /// Invocations that returned a failure.
    pub failed_invocations: u64,
    pub expectations_met: u64,
    pub expectations_failed: u64,
    /// Invocation latency samples (ms).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_invocations: 0,
            successful_invocations: 0,
            failed_invocations: 0,
            expectations_met: 0,
            expectations_failed: 0,
            latency_samples: VecDeque::with_capacity(1000),
            max_samples: 1000,
        }
    }

    /// Record a successful invocation.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_invocations += 1;
        self.successful_invocations += 1;
        self.record_latency(latency_ms);
    }

    /// Record a failed invocation.
    pub fn record_failure(&mut self, latency_ms: u64) {
        self.total_invocations += 1;
        self.failed_invocations += 1;
        self.record_latency(latency_ms);
    }

    pub fn record_expectation(&mut self, met: bool) {
        if met {
            self.expectations_met += 1;
        } else {
            self.expectations_failed += 1;
        }
    }

    fn record_latency(&mut self, latency_ms: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
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

    /// Share of invocations that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 0.0;
        }

        self.successful_invocations as f64 / self.total_invocations as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(100);
        metrics.record_success(200);
        metrics.record_success(150);
        metrics.record_failure(10);
        metrics.record_expectation(true);
        metrics.record_expectation(false);

        assert_eq!(metrics.total_invocations, 4);
        assert_eq!(metrics.successful_invocations, 3);
        assert_eq!(metrics.failed_invocations, 1);
        assert_eq!(metrics.average_latency_ms(), 115);
        assert_eq!(metrics.p99_latency_ms(), 200);
        assert_eq!(metrics.success_rate(), 0.75);
        assert_eq!((metrics.expectations_met, metrics.expectations_failed), (1, 1));
    }
}
