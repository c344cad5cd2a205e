//! Point-in-time copies of shared state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::resource::ResourceMetrics;

/// An immutable, timestamped copy of shared state.
///
/// Snapshots are created only by the [`StateManager`] and never alias live
/// state; the captured map is a defensive copy taken under the state lock.
/// Once created, a snapshot's content never changes — the only mutation
/// allowed is clearing the `valid` flag, which removes the snapshot from
/// consideration as a rollback target without touching history ordering.
///
/// [`StateManager`]: crate::state::StateManager
#[derive(Debug)]
pub struct StateSnapshot {
    /// Monotonically increasing snapshot ID
    id: u64,

    /// When the snapshot was captured
    captured_at: DateTime<Utc>,

    /// Why the snapshot was captured
    reason: String,

    /// The captured key-value state
    state: HashMap<String, Value>,

    /// Resource readings current at capture time
    metrics: ResourceMetrics,

    /// Whether the snapshot is still a viable rollback target
    valid: AtomicBool,
}

impl StateSnapshot {
    pub(crate) fn new(
        id: u64,
        reason: impl Into<String>,
        state: HashMap<String, Value>,
        metrics: ResourceMetrics,
        valid: bool,
    ) -> Self {
        Self {
            id,
            captured_at: Utc::now(),
            reason: reason.into(),
            state,
            metrics,
            valid: AtomicBool::new(valid),
        }
    }

    /// Get the snapshot ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get when the snapshot was captured.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Get why the snapshot was captured.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the captured state.
    pub fn state(&self) -> &HashMap<String, Value> {
        &self.state
    }

    /// Get the resource readings captured alongside the state.
    pub fn metrics(&self) -> &ResourceMetrics {
        &self.metrics
    }

    /// Check whether the snapshot is still a viable rollback target.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Remove the snapshot from consideration as a rollback target.
    ///
    /// This is one-way; an invalidated snapshot stays in history until it is
    /// evicted, but `find_last_valid_snapshot` will skip it.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}
