//! Configuration for the supervision layer.
//!
//! All thresholds and intervals in the subsystem are gathered here so a host
//! can tune them from its own configuration surface. Every field has a
//! default matching the documented behavior, so `SupervisorConfig::default()`
//! is a fully working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Supervisor`] and everything it owns.
///
/// [`Supervisor`]: crate::supervise::Supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum number of snapshots retained in history
    #[serde(default = "defaults::snapshot_capacity")]
    pub snapshot_capacity: usize,

    /// Consecutive recovery failures before a unit is quarantined
    #[serde(default = "defaults::quarantine_threshold")]
    pub quarantine_threshold: u32,

    /// Wall-clock timeout for a single isolated call, in milliseconds
    #[serde(default = "defaults::call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Per-unit memory ceiling, in bytes
    #[serde(default = "defaults::memory_ceiling_bytes")]
    pub memory_ceiling_bytes: u64,

    /// Capacity of a unit's submission queue
    #[serde(default = "defaults::worker_queue_size")]
    pub worker_queue_size: usize,

    /// Interval between scheduled snapshots, in milliseconds
    #[serde(default = "defaults::snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// Interval between health-check scans, in milliseconds
    #[serde(default = "defaults::health_interval_ms")]
    pub health_interval_ms: u64,

    /// Soft latency target for a rollback, in milliseconds
    #[serde(default = "defaults::rollback_target_ms")]
    pub rollback_target_ms: u64,

    /// Per-descriptor failure count above which execution is blocked
    #[serde(default = "defaults::failure_block_threshold")]
    pub failure_block_threshold: u32,

    /// Per-descriptor failure count above which execution is risky
    #[serde(default = "defaults::failure_risky_threshold")]
    pub failure_risky_threshold: u32,

    /// Memory-used ratio above which all execution is blocked
    #[serde(default = "defaults::memory_critical_ratio")]
    pub memory_critical_ratio: f64,

    /// Memory-used ratio above which execution is considered risky
    #[serde(default = "defaults::memory_elevated_ratio")]
    pub memory_elevated_ratio: f64,

    /// Maximum number of descriptors tracked in the failure history
    #[serde(default = "defaults::failure_history_capacity")]
    pub failure_history_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: defaults::snapshot_capacity(),
            quarantine_threshold: defaults::quarantine_threshold(),
            call_timeout_ms: defaults::call_timeout_ms(),
            memory_ceiling_bytes: defaults::memory_ceiling_bytes(),
            worker_queue_size: defaults::worker_queue_size(),
            snapshot_interval_ms: defaults::snapshot_interval_ms(),
            health_interval_ms: defaults::health_interval_ms(),
            rollback_target_ms: defaults::rollback_target_ms(),
            failure_block_threshold: defaults::failure_block_threshold(),
            failure_risky_threshold: defaults::failure_risky_threshold(),
            memory_critical_ratio: defaults::memory_critical_ratio(),
            memory_elevated_ratio: defaults::memory_elevated_ratio(),
            failure_history_capacity: defaults::failure_history_capacity(),
        }
    }
}

impl SupervisorConfig {
    /// The per-call wall-clock timeout as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// The scheduled-snapshot interval as a `Duration`.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// The health-check interval as a `Duration`.
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// The soft rollback latency target as a `Duration`.
    pub fn rollback_target(&self) -> Duration {
        Duration::from_millis(self.rollback_target_ms)
    }
}

mod defaults {
    pub fn snapshot_capacity() -> usize {
        10
    }

    pub fn quarantine_threshold() -> u32 {
        3
    }

    pub fn call_timeout_ms() -> u64 {
        30_000
    }

    pub fn memory_ceiling_bytes() -> u64 {
        256 * 1024 * 1024
    }

    pub fn worker_queue_size() -> usize {
        64
    }

    pub fn snapshot_interval_ms() -> u64 {
        30_000
    }

    pub fn health_interval_ms() -> u64 {
        5_000
    }

    pub fn rollback_target_ms() -> u64 {
        10
    }

    pub fn failure_block_threshold() -> u32 {
        5
    }

    pub fn failure_risky_threshold() -> u32 {
        2
    }

    pub fn memory_critical_ratio() -> f64 {
        0.95
    }

    pub fn memory_elevated_ratio() -> f64 {
        0.85
    }

    pub fn failure_history_capacity() -> usize {
        256
    }
}
