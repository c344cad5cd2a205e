//! Crash prediction.
//!
//! A heuristic classifier that turns an opaque context descriptor, the
//! descriptor's failure history, and the live memory reading into a
//! [`Verdict`] before anything runs. Verdicts are deterministic and
//! auditable: every prediction carries a concrete reason string, never a
//! black-box score.

mod predictor;

pub use predictor::CrashPredictor;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a prospective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// No known risk; run normally
    Safe,

    /// Elevated risk; run with a precautionary snapshot
    Risky,

    /// Refused; the operation must not run
    Blocked,

    /// No basis for a judgment
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Safe => "safe",
            Verdict::Risky => "risky",
            Verdict::Blocked => "blocked",
            Verdict::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A single prediction, recomputed per call and never persisted.
#[derive(Debug, Clone)]
pub struct CrashPrediction {
    /// The classification
    pub verdict: Verdict,

    /// Confidence in the verdict, 0-100
    pub confidence: u8,

    /// Concrete, human-readable basis for the verdict
    pub reason: String,
}

impl CrashPrediction {
    pub(crate) fn new(verdict: Verdict, confidence: u8, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            confidence,
            reason: reason.into(),
        }
    }
}
