//! Supervision and orchestration.
//!
//! The [`Supervisor`] ties the other components together: it validates work
//! with the crash predictor, snapshots around risky operations, runs actions
//! inside per-unit isolators, rolls shared state back on failure, and
//! quarantines units that fail repeatedly. Independent background loops take
//! scheduled snapshots and watch for memory pressure and blocked workers.

mod background;
mod supervisor;

pub use supervisor::Supervisor;

use crate::error::Error;

/// Lifecycle states of a supervised unit.
///
/// `Quarantined` is terminal: there is no un-quarantine transition, by
/// design. Clearing it requires explicit external action (unload is refused
/// for quarantined units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// The unit is loaded and has not run yet
    Loaded,

    /// The unit is currently executing inside its isolator
    Running,

    /// The unit's last run completed
    Completed,

    /// The unit's last run failed
    Failed,

    /// The unit is permanently excluded from execution
    Quarantined,
}

/// Per-unit failure accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureRecord {
    /// Failures since the last fully successful run or recovery reset
    pub consecutive: u32,

    /// All failures over the unit's lifetime
    pub total: u64,

    /// Whether the unit has been quarantined
    pub quarantined: bool,
}

/// The outcome of a supervised run.
///
/// This is the complete set of results a caller can observe from
/// [`Supervisor::run_safely`]; no error ever escapes the supervisor
/// unconverted.
#[derive(Debug)]
pub enum RunOutcome<T> {
    /// The action completed and produced a value
    Success(T),

    /// The action failed, but rollback recovery succeeded; the host is
    /// degraded but alive
    Recovered,

    /// The action failed and recovery was not possible
    Failed(Error),

    /// Execution was refused before anything ran
    Blocked {
        /// Human-readable reason for the refusal
        reason: String,
        /// Confidence of the verdict, 0-100
        confidence: u8,
    },
}

impl<T> RunOutcome<T> {
    /// Whether the run produced a value.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    /// Whether the run failed but was recovered by rollback.
    pub fn is_recovered(&self) -> bool {
        matches!(self, RunOutcome::Recovered)
    }

    /// Whether the run failed without recovery.
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    /// Whether execution was refused up front.
    pub fn is_blocked(&self) -> bool {
        matches!(self, RunOutcome::Blocked { .. })
    }

    /// The produced value, if any.
    pub fn success(self) -> Option<T> {
        match self {
            RunOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}
