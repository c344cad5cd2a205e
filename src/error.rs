//! Error types for the aegis supervision layer.
//!
//! This module defines the error hierarchy used throughout the crate. The
//! errors are organized by subsystem: isolation failures (the supervised
//! action, its worker, or its resource budget), state failures (snapshot and
//! rollback problems), and prediction refusals.
//!
//! The root error type, `Error`, can wrap any of the subsystem-specific
//! errors, allowing for uniform error handling at the top level. The
//! supervisor itself never lets any of these escape `run_safely`; callers
//! only ever observe them inside a [`RunOutcome::Failed`] variant.
//!
//! [`RunOutcome::Failed`]: crate::supervise::RunOutcome::Failed

use thiserror::Error;

/// Root error type for the aegis system.
#[derive(Debug, Error)]
pub enum Error {
    /// Isolation-related errors
    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    /// Snapshot and rollback errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Execution refused before running anything
    #[error("Blocked by prediction (confidence {confidence}): {reason}")]
    Blocked {
        /// Human-readable reason for the refusal
        reason: String,
        /// Confidence of the verdict, 0-100
        confidence: u8,
    },

    /// The unit has been permanently quarantined
    #[error("Unit is quarantined: {0}")]
    Quarantined(String),

    /// A unit with this ID already exists and was not unloaded
    #[error("Unit is already loaded: {0}")]
    UnitAlreadyLoaded(String),

    /// The supervisor is shutting down and admits no new work
    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// Errors raised by a unit's execution isolator.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The supervised action returned an error
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// The supervised action panicked inside the worker
    #[error("Action panicked: {0}")]
    ActionPanicked(String),

    /// The call exceeded the wall-clock timeout
    #[error("Action timed out after {0}ms")]
    Timeout(u64),

    /// Process memory was already over the unit's ceiling before the call
    #[error("Memory budget exceeded: {used_bytes} bytes used, ceiling {ceiling_bytes} bytes")]
    ResourceExceeded {
        /// Current process memory reading, in bytes
        used_bytes: u64,
        /// The unit's configured ceiling, in bytes
        ceiling_bytes: u64,
    },

    /// The unit's submission queue is saturated
    #[error("Worker queue is full for unit: {0}")]
    QueueFull(String),

    /// The isolation context has been torn down
    #[error("Isolation context is shut down for unit: {0}")]
    Shutdown(String),
}

/// Errors raised by the state manager during snapshot and rollback work.
#[derive(Debug, Error)]
pub enum StateError {
    /// No snapshot in history is still marked valid
    #[error("No valid snapshot available for rollback")]
    NoValidSnapshot,

    /// The requested snapshot has been invalidated
    #[error("Snapshot {0} has been invalidated")]
    SnapshotInvalidated(u64),

    /// Shared state was marked corrupted and has not been recovered
    #[error("Shared state is corrupted: {0}")]
    Corrupted(String),
}

/// Result type alias using the aegis error type.
pub type Result<T> = std::result::Result<T, Error>;
