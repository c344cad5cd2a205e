//! # Aegis
//!
//! `aegis` is a resilience and supervision layer for host processes that run
//! untrusted or unreliable third-party extension code. It predicts likely
//! failures before they happen, runs extension work inside bounded
//! isolation, continuously snapshots shared mutable state, and rolls back
//! quickly when something fails — all without stopping the host process.
//!
//! Key concepts:
//!
//! 1. **Unit**: an isolated, independently-failing piece of untrusted code,
//!    such as a loaded extension.
//!
//! 2. **Isolator**: a unit's execution sandbox — a dedicated single worker
//!    with a memory ceiling and a wall-clock timeout. Cooperative isolation,
//!    not OS sandboxing.
//!
//! 3. **Snapshot**: an immutable, timestamped copy of shared mutable state,
//!    retained in bounded history and used for rollback.
//!
//! 4. **Verdict**: the crash predictor's classification of a prospective
//!    operation (Safe / Risky / Blocked), derived from known-bad descriptor
//!    patterns, failure history, and live memory pressure.
//!
//! 5. **Quarantine**: permanent exclusion of a unit after repeated
//!    unrecovered failures. One-way by design.
//!
//! The host wraps every extension invocation in
//! [`Supervisor::run_safely`] and only ever observes one of the four
//! [`RunOutcome`] variants; no failure inside a unit escapes unconverted.
//!
//! ```
//! use aegis::{StaticResourceReader, Supervisor, SupervisorConfig};
//! use std::sync::Arc;
//!
//! let reader = Arc::new(StaticResourceReader::new(0, 1024 * 1024));
//! let supervisor = Supervisor::new(SupervisorConfig::default(), reader);
//!
//! let outcome = supervisor.run_safely("ext.greeter::hello", || Ok("hello"));
//! assert!(outcome.is_success());
//! ```

pub mod config;
pub mod error;
pub mod isolation;
pub mod predict;
pub mod resource;
pub mod state;
pub mod stats;
pub mod supervise;

// Re-export key types for easier access
pub use config::SupervisorConfig;
pub use error::{Error, IsolationError, Result, StateError};
pub use isolation::{ActionError, CrashHandler, ExecutionIsolator, IsolatorConfig};
pub use predict::{CrashPrediction, CrashPredictor, Verdict};
pub use resource::{ResourceMetrics, ResourceReader, StaticResourceReader};
pub use state::{StateManager, StateSnapshot};
pub use stats::{Statistics, StatsSnapshot};
pub use supervise::{FailureRecord, RunOutcome, Supervisor, UnitState};
