//! Aggregate supervision counters.
//!
//! Counters are monotonic, updated atomically, and read concurrently by the
//! host's telemetry surface through [`Statistics::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters maintained by the supervisor.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Total supervised runs attempted
    pub runs_total: AtomicU64,

    /// Executions refused by the crash predictor
    pub crashes_prevented: AtomicU64,

    /// Failures where rollback recovery succeeded
    pub successful_recoveries: AtomicU64,

    /// Runs that failed and could not be recovered
    pub failures_total: AtomicU64,

    /// Snapshots captured, scheduled and on-demand
    pub snapshots_taken: AtomicU64,

    /// Rollbacks performed
    pub rollbacks_performed: AtomicU64,

    /// Units permanently quarantined
    pub units_quarantined: AtomicU64,

    /// Blocked workers observed by the health loop
    pub blocked_workers_detected: AtomicU64,
}

impl Statistics {
    /// Create a fresh counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a consistent-enough view of all counters.
    ///
    /// Each counter is read atomically; the set as a whole is not a single
    /// atomic read, which is acceptable for telemetry.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runs_total: self.runs_total.load(Ordering::Relaxed),
            crashes_prevented: self.crashes_prevented.load(Ordering::Relaxed),
            successful_recoveries: self.successful_recoveries.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            snapshots_taken: self.snapshots_taken.load(Ordering::Relaxed),
            rollbacks_performed: self.rollbacks_performed.load(Ordering::Relaxed),
            units_quarantined: self.units_quarantined.load(Ordering::Relaxed),
            blocked_workers_detected: self.blocked_workers_detected.load(Ordering::Relaxed),
        }
    }
}

/// A read-only copy of the counters, for the host's telemetry surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total supervised runs attempted
    pub runs_total: u64,

    /// Executions refused by the crash predictor
    pub crashes_prevented: u64,

    /// Failures where rollback recovery succeeded
    pub successful_recoveries: u64,

    /// Runs that failed and could not be recovered
    pub failures_total: u64,

    /// Snapshots captured, scheduled and on-demand
    pub snapshots_taken: u64,

    /// Rollbacks performed
    pub rollbacks_performed: u64,

    /// Units permanently quarantined
    pub units_quarantined: u64,

    /// Blocked workers observed by the health loop
    pub blocked_workers_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_start_at_zero() {
        let stats = Statistics::new();
        let snapshot = stats.snapshot();

        assert_eq!(snapshot.runs_total, 0);
        assert_eq!(snapshot.crashes_prevented, 0);
        assert_eq!(snapshot.successful_recoveries, 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(Statistics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        Statistics::increment(&stats.runs_total);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot().runs_total, 8000);
    }
}
