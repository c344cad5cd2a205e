//! The exclusive owner of shared mutable state.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StateError;
use crate::resource::ResourceReader;
use crate::state::StateSnapshot;

/// Owns the shared key-value state, its snapshot history, and rollback.
///
/// No other component may hold a direct mutable reference to the shared
/// state; [`set_state`] and [`get_state`] are the only sanctioned accessors.
/// Snapshot history is newest-first with a fixed capacity, evicting the
/// oldest entry on overflow.
///
/// [`set_state`]: StateManager::set_state
/// [`get_state`]: StateManager::get_state
pub struct StateManager {
    /// The live shared state
    shared: RwLock<HashMap<String, Value>>,

    /// Snapshot history, newest at the front
    history: Mutex<VecDeque<Arc<StateSnapshot>>>,

    /// Maximum number of retained snapshots
    capacity: usize,

    /// Next snapshot ID
    next_id: AtomicU64,

    /// Sticky corruption marker, cleared only by a successful rollback
    corrupted: Mutex<Option<String>>,

    /// Host-supplied resource reader
    reader: Arc<dyn ResourceReader>,
}

impl StateManager {
    /// Create a state manager with the given history capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of snapshots retained; must be non-zero.
    /// * `reader` - The host-supplied resource reader.
    pub fn new(capacity: usize, reader: Arc<dyn ResourceReader>) -> Self {
        Self {
            shared: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            corrupted: Mutex::new(None),
            reader,
        }
    }

    /// Set a value in the shared state.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.shared.write().insert(key.into(), value);
    }

    /// Get a value from the shared state.
    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.shared.read().get(key).cloned()
    }

    /// Capture a snapshot of the shared state.
    ///
    /// Takes a defensive copy of the state and the current resource reading,
    /// assigns the next monotonic ID, and pushes the snapshot to the front of
    /// history, evicting the oldest entry past capacity. The snapshot is
    /// marked valid only if the resource reading passes sanity checks.
    pub fn capture_snapshot(&self, reason: impl Into<String>) -> Arc<StateSnapshot> {
        let reason = reason.into();
        let copy = self.shared.read().clone();
        let metrics = self.reader.metrics();
        let valid = metrics.is_sane();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(StateSnapshot::new(id, reason, copy, metrics, valid));

        let mut history = self.history.lock();
        history.push_front(snapshot.clone());
        while history.len() > self.capacity {
            if let Some(evicted) = history.pop_back() {
                debug!("Evicted snapshot {} from history", evicted.id());
            }
        }

        debug!(
            "Captured snapshot {} (reason: {}, valid: {})",
            snapshot.id(),
            snapshot.reason(),
            valid
        );

        snapshot
    }

    /// Roll the shared state back to a snapshot.
    ///
    /// Replaces the live state with a fresh copy of the snapshot's captured
    /// state, so later mutation of live state can never corrupt the stored
    /// snapshot. A successful rollback clears the corruption marker.
    ///
    /// # Returns
    ///
    /// The time the swap took, or a [`StateError`] if the snapshot has been
    /// invalidated.
    pub fn rollback(&self, snapshot: &StateSnapshot) -> Result<Duration, StateError> {
        if !snapshot.is_valid() {
            return Err(StateError::SnapshotInvalidated(snapshot.id()));
        }

        let start = Instant::now();
        let restored = snapshot.state().clone();
        {
            let mut shared = self.shared.write();
            *shared = restored;
        }
        *self.corrupted.lock() = None;
        let elapsed = start.elapsed();

        info!(
            "Rolled back to snapshot {} in {}us",
            snapshot.id(),
            elapsed.as_micros()
        );

        Ok(elapsed)
    }

    /// Mark the shared state as corrupted.
    ///
    /// The marker is sticky: it is cleared only by a successful rollback.
    pub fn mark_corrupted(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Shared state marked corrupted: {}", reason);
        *self.corrupted.lock() = Some(reason);
    }

    /// Check whether the shared state is marked corrupted.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.lock().is_some()
    }

    /// Find the most recent snapshot still marked valid.
    ///
    /// Scans history newest to oldest and returns the first valid entry.
    pub fn find_last_valid_snapshot(&self) -> Option<Arc<StateSnapshot>> {
        self.history
            .lock()
            .iter()
            .find(|snapshot| snapshot.is_valid())
            .cloned()
    }

    /// The number of snapshots currently retained.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Drop all but the `keep` newest snapshots.
    ///
    /// Used by the health loop when memory pressure calls for aggressive
    /// cleanup.
    ///
    /// # Returns
    ///
    /// The number of snapshots evicted.
    pub fn prune_history(&self, keep: usize) -> usize {
        let mut history = self.history.lock();
        let mut evicted = 0;
        while history.len() > keep.max(1) {
            history.pop_back();
            evicted += 1;
        }
        if evicted > 0 {
            info!("Pruned {} snapshots from history", evicted);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::StaticResourceReader;

    fn manager(capacity: usize) -> StateManager {
        StateManager::new(capacity, Arc::new(StaticResourceReader::new(100, 1000)))
    }

    #[test]
    fn test_state_accessors() {
        let manager = manager(5);

        assert_eq!(manager.get_state("health"), None);
        manager.set_state("health", Value::from(100));
        assert_eq!(manager.get_state("health"), Some(Value::from(100)));
    }

    #[test]
    fn test_snapshot_ids_strictly_increase() {
        let manager = manager(5);

        let mut last_id = 0;
        for _ in 0..20 {
            let snapshot = manager.capture_snapshot("test");
            assert!(snapshot.id() > last_id);
            last_id = snapshot.id();
        }
    }

    #[test]
    fn test_history_capacity_evicts_oldest() {
        let manager = manager(3);

        for i in 0..5 {
            manager.set_state("i", Value::from(i));
            manager.capture_snapshot("test");
        }

        assert_eq!(manager.history_len(), 3);

        // The oldest surviving snapshot is the third capture
        let history = manager.history.lock();
        let oldest = history.back().unwrap();
        assert_eq!(oldest.state().get("i"), Some(&Value::from(2)));
    }

    #[test]
    fn test_rollback_restores_state() {
        let manager = manager(5);

        manager.set_state("gold", Value::from(500));
        let snapshot = manager.capture_snapshot("before-trade");

        manager.set_state("gold", Value::from(0));
        manager.set_state("cursed", Value::from(true));

        let elapsed = manager.rollback(&snapshot).unwrap();
        assert!(elapsed < Duration::from_secs(1));

        assert_eq!(manager.get_state("gold"), Some(Value::from(500)));
        assert_eq!(manager.get_state("cursed"), None);
    }

    #[test]
    fn test_rollback_then_capture_yields_equal_state() {
        let manager = manager(5);

        manager.set_state("a", Value::from(1));
        let snapshot = manager.capture_snapshot("s");

        manager.set_state("a", Value::from(2));
        manager.rollback(&snapshot).unwrap();

        let recapture = manager.capture_snapshot("s-prime");
        assert_eq!(recapture.state(), snapshot.state());
    }

    #[test]
    fn test_rollback_does_not_alias_snapshot() {
        let manager = manager(5);

        manager.set_state("a", Value::from(1));
        let snapshot = manager.capture_snapshot("s");
        manager.rollback(&snapshot).unwrap();

        // Mutating live state after rollback must not touch the snapshot
        manager.set_state("a", Value::from(99));
        assert_eq!(snapshot.state().get("a"), Some(&Value::from(1)));
    }

    #[test]
    fn test_rollback_rejects_invalidated_snapshot() {
        let manager = manager(5);
        let snapshot = manager.capture_snapshot("s");

        snapshot.invalidate();
        let err = manager.rollback(&snapshot).unwrap_err();
        assert!(matches!(err, StateError::SnapshotInvalidated(_)));
    }

    #[test]
    fn test_find_last_valid_skips_invalidated() {
        let manager = manager(5);

        let first = manager.capture_snapshot("first");
        let second = manager.capture_snapshot("second");

        second.invalidate();
        let found = manager.find_last_valid_snapshot().unwrap();
        assert_eq!(found.id(), first.id());

        first.invalidate();
        assert!(manager.find_last_valid_snapshot().is_none());
    }

    #[test]
    fn test_insane_reading_marks_snapshot_invalid() {
        let reader = Arc::new(StaticResourceReader::new(100, 0));
        let manager = StateManager::new(5, reader);

        let snapshot = manager.capture_snapshot("bad-reading");
        assert!(!snapshot.is_valid());
        assert!(manager.find_last_valid_snapshot().is_none());
    }

    #[test]
    fn test_corruption_flag_cleared_by_rollback() {
        let manager = manager(5);
        let snapshot = manager.capture_snapshot("s");

        manager.mark_corrupted("test corruption");
        assert!(manager.is_corrupted());

        manager.rollback(&snapshot).unwrap();
        assert!(!manager.is_corrupted());
    }

    #[test]
    fn test_prune_history() {
        let manager = manager(10);
        for _ in 0..10 {
            manager.capture_snapshot("s");
        }

        let evicted = manager.prune_history(2);
        assert_eq!(evicted, 8);
        assert_eq!(manager.history_len(), 2);

        // The newest snapshots survive
        let newest = manager.find_last_valid_snapshot().unwrap();
        assert_eq!(newest.id(), 10);
    }
}
