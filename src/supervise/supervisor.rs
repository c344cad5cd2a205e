//! The orchestrator for supervised execution.

use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::error::{Error, IsolationError, Result, StateError};
use crate::isolation::{ActionError, CrashHandler, ExecutionIsolator, IsolatorConfig};
use crate::predict::{CrashPrediction, CrashPredictor, Verdict};
use crate::resource::ResourceReader;
use crate::state::StateManager;
use crate::stats::{Statistics, StatsSnapshot};
use crate::supervise::background::{spawn_supervised_loop, LoopHandle};
use crate::supervise::{FailureRecord, RunOutcome, UnitState};

/// Cleanup-aggressiveness levels escalated by the health loop.
const CLEANUP_CALM: u8 = 0;
const CLEANUP_ELEVATED: u8 = 1;
const CLEANUP_AGGRESSIVE: u8 = 2;

/// Everything the supervisor knows about one unit.
struct UnitRecord {
    unit_id: String,

    /// The unit's dedicated execution sandbox
    isolator: ExecutionIsolator,

    /// Failure accounting, guarded per-unit so unrelated units never contend
    failures: Mutex<FailureRecord>,

    /// Current lifecycle state
    state: Mutex<UnitState>,
}

/// Orchestrates prediction, isolation, snapshots, and recovery.
///
/// Construct one explicitly and pass it where it is needed; there is no
/// global accessor, and multiple independent supervisors can coexist (which
/// is how the tests run).
///
/// Every extension invocation goes through [`run_safely`]; callers only ever
/// observe one of the four [`RunOutcome`] variants.
///
/// [`run_safely`]: Supervisor::run_safely
pub struct Supervisor {
    config: SupervisorConfig,
    reader: Arc<dyn ResourceReader>,
    state: Arc<StateManager>,
    predictor: Arc<CrashPredictor>,
    stats: Arc<Statistics>,
    units: Arc<DashMap<String, Arc<UnitRecord>>>,

    /// Background loop handles, populated by `initialize`
    loops: Mutex<Vec<LoopHandle>>,

    initialized: AtomicBool,
    shut_down: AtomicBool,

    /// Current cleanup-aggressiveness level, escalated under pressure
    cleanup_level: Arc<AtomicU8>,
}

impl Supervisor {
    /// Create a supervisor with the given configuration and resource reader.
    pub fn new(config: SupervisorConfig, reader: Arc<dyn ResourceReader>) -> Self {
        let state = Arc::new(StateManager::new(config.snapshot_capacity, reader.clone()));
        let predictor = Arc::new(CrashPredictor::new(&config, reader.clone()));

        Self {
            config,
            reader,
            state,
            predictor,
            stats: Arc::new(Statistics::new()),
            units: Arc::new(DashMap::new()),
            loops: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            cleanup_level: Arc::new(AtomicU8::new(CLEANUP_CALM)),
        }
    }

    /// Start the background snapshot and health-check loops.
    ///
    /// Idempotent; bound to host startup. Supervised runs work without
    /// initialization, but scheduled snapshots and pressure scans do not.
    pub fn initialize(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            warn!("Supervisor is shut down; not starting background loops");
            return;
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Supervisor initializing background loops");
        let mut loops = self.loops.lock();
        if self.shut_down.load(Ordering::Acquire) {
            // Shutdown raced in between the flag check and the lock; it has
            // already drained this vec, so nothing may be added now
            return;
        }

        let snapshot_state = self.state.clone();
        let snapshot_stats = self.stats.clone();
        loops.push(spawn_supervised_loop(
            "snapshot",
            self.config.snapshot_interval(),
            move || {
                snapshot_state.capture_snapshot("scheduled");
                Statistics::increment(&snapshot_stats.snapshots_taken);
            },
        ));

        let health = HealthCheck {
            state: self.state.clone(),
            reader: self.reader.clone(),
            units: self.units.clone(),
            stats: self.stats.clone(),
            cleanup_level: self.cleanup_level.clone(),
            critical_ratio: self.config.memory_critical_ratio,
            elevated_ratio: self.config.memory_elevated_ratio,
            call_timeout: self.config.call_timeout(),
            snapshot_capacity: self.config.snapshot_capacity,
        };
        loops.push(spawn_supervised_loop(
            "health",
            self.config.health_interval(),
            move || health.tick(),
        ));
    }

    /// Stop background loops and tear down every isolator.
    ///
    /// Idempotent; bound to host stop. Subsequent supervised calls fail
    /// fast.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Supervisor shutting down");
        for handle in self.loops.lock().drain(..) {
            handle.stop();
        }
        for entry in self.units.iter() {
            entry.isolator.shutdown();
        }
    }

    /// Ask the crash predictor for a verdict on a descriptor.
    ///
    /// Never fails. A `Blocked` verdict counts as a prevented crash.
    pub fn validate(&self, descriptor: &str) -> CrashPrediction {
        let prediction = self.predictor.predict(descriptor);
        if prediction.verdict == Verdict::Blocked {
            Statistics::increment(&self.stats.crashes_prevented);
            info!(
                "Blocked '{}' (confidence {}): {}",
                descriptor, prediction.confidence, prediction.reason
            );
        }
        prediction
    }

    /// Run an action under full supervision.
    ///
    /// The action runs inside the unit's isolator, never on the caller's
    /// stack; the caller blocks, with the configured timeout, on the result.
    /// Risky verdicts capture a precautionary snapshot first. On failure the
    /// supervisor attempts rollback recovery; repeated unrecovered failures
    /// quarantine the unit.
    ///
    /// The unit is named by the descriptor's leading `::`-separated segment
    /// (the whole descriptor if it has none) and is created lazily on first
    /// use.
    pub fn run_safely<T, F>(&self, descriptor: &str, action: F) -> RunOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, ActionError> + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return RunOutcome::Failed(Error::ShuttingDown);
        }

        Statistics::increment(&self.stats.runs_total);

        let unit_id = unit_id_of(descriptor);
        if self.is_quarantined(unit_id) {
            return RunOutcome::Blocked {
                reason: format!("unit {} is quarantined", unit_id),
                confidence: 100,
            };
        }

        let prediction = self.validate(descriptor);
        if prediction.verdict == Verdict::Blocked {
            return RunOutcome::Blocked {
                reason: prediction.reason,
                confidence: prediction.confidence,
            };
        }

        let record = self.get_or_create_unit(unit_id);
        if record.failures.lock().quarantined {
            // Quarantined concurrently, between the check above and now
            return RunOutcome::Blocked {
                reason: format!("unit {} is quarantined", unit_id),
                confidence: 100,
            };
        }

        // Sticky corruption gate: recover before admitting new work. A
        // refusal here is not the unit's fault and does not count against
        // its failure record.
        if self.state.is_corrupted() && !self.attempt_recovery(descriptor) {
            Statistics::increment(&self.stats.failures_total);
            return RunOutcome::Failed(
                StateError::Corrupted("unrecovered corrupted state".to_string()).into(),
            );
        }

        if prediction.verdict == Verdict::Risky {
            self.state
                .capture_snapshot(format!("pre-risky-{}", descriptor));
            Statistics::increment(&self.stats.snapshots_taken);
        }

        *record.state.lock() = UnitState::Running;

        match record.isolator.execute_with_result(action) {
            Ok(value) => {
                self.predictor.record_success(descriptor);
                record.failures.lock().consecutive = 0;
                *record.state.lock() = UnitState::Completed;
                RunOutcome::Success(value)
            }
            Err(err) => {
                self.predictor.record_crash(descriptor);
                record.failures.lock().total += 1;
                *record.state.lock() = UnitState::Failed;

                if self.attempt_recovery(descriptor) {
                    Statistics::increment(&self.stats.successful_recoveries);
                    info!("Recovered from failure in '{}': {}", descriptor, err);
                    RunOutcome::Recovered
                } else {
                    Statistics::increment(&self.stats.failures_total);
                    self.note_unit_failure(&record, err)
                }
            }
        }
    }

    /// Roll shared state back to the last valid snapshot.
    ///
    /// Absence of any valid snapshot counts as recovery failure; it is
    /// logged, never thrown. The soft rollback latency target is reported
    /// but does not fail an otherwise successful rollback.
    pub fn attempt_recovery(&self, descriptor: &str) -> bool {
        let Some(snapshot) = self.state.find_last_valid_snapshot() else {
            warn!("Recovery failed for '{}': no valid snapshot", descriptor);
            return false;
        };

        match self.state.rollback(&snapshot) {
            Ok(elapsed) => {
                Statistics::increment(&self.stats.rollbacks_performed);
                if elapsed > self.config.rollback_target() {
                    warn!(
                        "Rollback for '{}' took {}us, over the {}ms target",
                        descriptor,
                        elapsed.as_micros(),
                        self.config.rollback_target_ms
                    );
                }
                true
            }
            Err(err) => {
                warn!("Recovery failed for '{}': {}", descriptor, err);
                false
            }
        }
    }

    /// Run a unit's first-time initialization inside its isolator.
    ///
    /// Creates the unit's isolation context. Re-creation under the same ID
    /// is allowed only after an explicit [`unload_unit`], never after
    /// quarantine.
    ///
    /// [`unload_unit`]: Supervisor::unload_unit
    pub fn load_unit_isolated<F>(&self, unit_id: &str, load_action: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), ActionError> + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        if let Some(existing) = self.units.get(unit_id) {
            if existing.failures.lock().quarantined {
                return Err(Error::Quarantined(unit_id.to_string()));
            }
            return Err(Error::UnitAlreadyLoaded(unit_id.to_string()));
        }

        let record = self.get_or_create_unit(unit_id);
        match record.isolator.execute_with_result(load_action) {
            Ok(()) => {
                *record.state.lock() = UnitState::Loaded;
                info!("Unit {} loaded in isolation", unit_id);
                Ok(())
            }
            Err(err) => {
                *record.state.lock() = UnitState::Failed;
                record.failures.lock().total += 1;
                Err(err)
            }
        }
    }

    /// Remove a unit and tear down its isolation context.
    ///
    /// Idempotent for unknown units. Refused for quarantined units:
    /// quarantine is a one-way fail-safe and unloading would permit
    /// re-creation.
    pub fn unload_unit(&self, unit_id: &str) -> Result<()> {
        let removed = self
            .units
            .remove_if(unit_id, |_, record| !record.failures.lock().quarantined);

        if let Some((_, record)) = removed {
            record.isolator.shutdown();
            info!("Unit {} unloaded", unit_id);
            return Ok(());
        }

        if self.is_quarantined(unit_id) {
            return Err(Error::Quarantined(unit_id.to_string()));
        }
        Ok(())
    }

    /// Permanently exclude a unit from execution.
    ///
    /// One-way: there is no un-quarantine API.
    pub fn quarantine(&self, unit_id: &str) {
        let record = self.get_or_create_unit(unit_id);
        self.quarantine_record(&record);
    }

    /// Whether a unit has been quarantined.
    pub fn is_quarantined(&self, unit_id: &str) -> bool {
        self.units
            .get(unit_id)
            .map(|record| record.failures.lock().quarantined)
            .unwrap_or(false)
    }

    /// The lifecycle state of a unit, if it is known.
    pub fn unit_state(&self, unit_id: &str) -> Option<UnitState> {
        self.units.get(unit_id).map(|record| *record.state.lock())
    }

    /// A unit's failure accounting, if it is known.
    pub fn failure_record(&self, unit_id: &str) -> Option<FailureRecord> {
        self.units.get(unit_id).map(|record| *record.failures.lock())
    }

    /// A read-only snapshot of the aggregate counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The state manager owning the shared state this supervisor protects.
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// The current cleanup-aggressiveness level (0 calm, 2 aggressive).
    pub fn cleanup_aggressiveness(&self) -> u8 {
        self.cleanup_level.load(Ordering::Relaxed)
    }

    fn get_or_create_unit(&self, unit_id: &str) -> Arc<UnitRecord> {
        self.units
            .entry(unit_id.to_string())
            .or_insert_with(|| Arc::new(self.new_unit_record(unit_id)))
            .clone()
    }

    fn new_unit_record(&self, unit_id: &str) -> UnitRecord {
        let state = self.state.clone();
        let crash_handler: CrashHandler = Arc::new(move |unit_id, err| {
            error!("Crash handler invoked for unit {}: {}", unit_id, err);

            // A panic or timeout may have left a half-applied mutation
            // behind; a clean action error or a pre-execution refusal did
            // not touch shared state.
            if matches!(
                err,
                Error::Isolation(IsolationError::ActionPanicked(_))
                    | Error::Isolation(IsolationError::Timeout(_))
            ) {
                state.mark_corrupted(format!("unit {} crashed mid-execution", unit_id));
            }
        });

        let isolator_config = IsolatorConfig {
            memory_ceiling_bytes: self.config.memory_ceiling_bytes,
            call_timeout: self.config.call_timeout(),
            queue_size: self.config.worker_queue_size,
        };

        UnitRecord {
            unit_id: unit_id.to_string(),
            isolator: ExecutionIsolator::new(
                unit_id,
                isolator_config,
                self.reader.clone(),
                crash_handler,
            ),
            failures: Mutex::new(FailureRecord::default()),
            state: Mutex::new(UnitState::Loaded),
        }
    }

    /// Count an unrecovered failure against a unit, quarantining it once the
    /// consecutive count reaches the threshold.
    fn note_unit_failure<T>(&self, record: &UnitRecord, err: Error) -> RunOutcome<T> {
        let should_quarantine = {
            let mut failures = record.failures.lock();
            failures.consecutive += 1;
            failures.consecutive >= self.config.quarantine_threshold
        };

        if should_quarantine {
            self.quarantine_record(record);
        }

        RunOutcome::Failed(err)
    }

    fn quarantine_record(&self, record: &UnitRecord) {
        {
            let mut failures = record.failures.lock();
            if failures.quarantined {
                return;
            }
            failures.quarantined = true;
        }

        *record.state.lock() = UnitState::Quarantined;
        record.isolator.shutdown();
        Statistics::increment(&self.stats.units_quarantined);
        error!("Unit {} quarantined", record.unit_id);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The unit a descriptor belongs to: its leading `::`-separated segment.
fn unit_id_of(descriptor: &str) -> &str {
    descriptor.split("::").next().unwrap_or(descriptor)
}

/// State shared with the health-check loop.
struct HealthCheck {
    state: Arc<StateManager>,
    reader: Arc<dyn ResourceReader>,
    units: Arc<DashMap<String, Arc<UnitRecord>>>,
    stats: Arc<Statistics>,
    cleanup_level: Arc<AtomicU8>,
    critical_ratio: f64,
    elevated_ratio: f64,
    call_timeout: Duration,
    snapshot_capacity: usize,
}

impl HealthCheck {
    /// One scan: blocked workers first, then memory pressure.
    fn tick(&self) {
        for entry in self.units.iter() {
            if let Some(busy) = entry.isolator.busy_for() {
                if busy > self.call_timeout {
                    warn!(
                        "Worker for unit {} has been blocked for {}ms",
                        entry.unit_id,
                        busy.as_millis()
                    );
                    Statistics::increment(&self.stats.blocked_workers_detected);
                }
            }
        }

        let ratio = self.reader.memory_ratio();
        if ratio > self.critical_ratio {
            self.cleanup_level
                .store(CLEANUP_AGGRESSIVE, Ordering::Relaxed);
            error!(
                "Memory ratio {:.2} above critical {:.2}; emergency snapshot and aggressive cleanup",
                ratio, self.critical_ratio
            );
            self.state.capture_snapshot("emergency");
            Statistics::increment(&self.stats.snapshots_taken);
            self.state.prune_history((self.snapshot_capacity / 4).max(2));
        } else if ratio > self.elevated_ratio {
            self.cleanup_level.store(CLEANUP_ELEVATED, Ordering::Relaxed);
            warn!(
                "Memory ratio {:.2} above elevated {:.2}; trimming snapshot history",
                ratio, self.elevated_ratio
            );
            self.state.prune_history((self.snapshot_capacity / 2).max(2));
        } else {
            // Relax one level per calm tick
            let _ = self
                .cleanup_level
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |level| {
                    Some(level.saturating_sub(1))
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_of() {
        assert_eq!(unit_id_of("ext.combat::on_tick"), "ext.combat");
        assert_eq!(unit_id_of("bare-descriptor"), "bare-descriptor");
        assert_eq!(unit_id_of("a::b::c"), "a");
    }
}
