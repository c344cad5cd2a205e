//! Resource pressure readings.
//!
//! The subsystem never measures memory itself; it consumes a pressure reading
//! supplied by the host runtime through the [`ResourceReader`] trait. The
//! crash predictor and the health-check loop both key off the same reading,
//! and every snapshot records the metrics that were current when it was
//! taken.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of live memory-pressure readings.
///
/// Implemented by the host runtime; the supervision layer only ever reads
/// through this trait. Implementations must be cheap to call, as readings are
/// taken on every validation and every snapshot.
pub trait ResourceReader: Send + Sync {
    /// Current memory used by the process, in bytes.
    fn current_memory(&self) -> u64;

    /// Maximum memory available to the process, in bytes.
    fn max_memory(&self) -> u64;

    /// The memory-used ratio, in `0.0..=1.0`.
    fn memory_ratio(&self) -> f64 {
        let max = self.max_memory();
        if max == 0 {
            return 0.0;
        }
        self.current_memory() as f64 / max as f64
    }

    /// Capture the current readings as a value type.
    fn metrics(&self) -> ResourceMetrics {
        ResourceMetrics {
            memory_bytes: self.current_memory(),
            max_memory_bytes: self.max_memory(),
            captured_at: Utc::now(),
        }
    }
}

/// A point-in-time resource reading, stored alongside every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Memory used when the reading was taken, in bytes
    pub memory_bytes: u64,

    /// Maximum memory available when the reading was taken, in bytes
    pub max_memory_bytes: u64,

    /// When the reading was taken
    pub captured_at: DateTime<Utc>,
}

impl ResourceMetrics {
    /// Check that the reading is internally consistent.
    ///
    /// A reading is sane when the maximum is non-zero and the used figure
    /// does not exceed it.
    pub fn is_sane(&self) -> bool {
        self.max_memory_bytes > 0 && self.memory_bytes <= self.max_memory_bytes
    }
}

/// A reader backed by settable atomics.
///
/// Used by hosts that push readings in from their own runtime hooks, and by
/// tests that need to force a particular pressure level.
#[derive(Debug)]
pub struct StaticResourceReader {
    current: AtomicU64,
    max: AtomicU64,
}

impl StaticResourceReader {
    /// Create a reader with the given current and maximum readings.
    pub fn new(current: u64, max: u64) -> Self {
        Self {
            current: AtomicU64::new(current),
            max: AtomicU64::new(max),
        }
    }

    /// Update the current memory reading.
    pub fn set_current(&self, bytes: u64) {
        self.current.store(bytes, Ordering::Relaxed);
    }

    /// Update the maximum memory reading.
    pub fn set_max(&self, bytes: u64) {
        self.max.store(bytes, Ordering::Relaxed);
    }
}

impl Default for StaticResourceReader {
    fn default() -> Self {
        // A relaxed reading that reports no pressure at all
        Self::new(0, u64::MAX)
    }
}

impl ResourceReader for StaticResourceReader {
    fn current_memory(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn max_memory(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}
