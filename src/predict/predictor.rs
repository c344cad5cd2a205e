//! The heuristic crash classifier.

use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

use crate::config::SupervisorConfig;
use crate::predict::{CrashPrediction, Verdict};
use crate::resource::ResourceReader;

/// Descriptor substrings that have historically preceded crashes.
///
/// Matching is plain substring containment against the opaque descriptor
/// produced by the host's metadata scanners.
const KNOWN_BAD_PATTERNS: &[&str] = &[
    "deadlock_detected",
    "stack_overflow",
    "out_of_memory",
    "native_crash",
    "recursive_event_loop",
    "unbounded_allocation",
];

/// Predicts whether a prospective operation is likely to crash.
///
/// The prediction is a pure function of the known-bad patterns, the
/// descriptor's failure history, and the live memory ratio: identical inputs
/// always produce an identical verdict and confidence. History is held in an
/// explicitly bounded map with deterministic eviction.
pub struct CrashPredictor {
    /// Per-descriptor failure counters
    history: DashMap<String, u32>,

    /// Maximum number of descriptors tracked
    history_capacity: usize,

    /// Failure count above which execution is blocked
    block_threshold: u32,

    /// Failure count above which execution is risky
    risky_threshold: u32,

    /// Memory ratio above which everything is blocked
    critical_ratio: f64,

    /// Memory ratio above which execution is risky
    elevated_ratio: f64,

    /// Host-supplied resource reader
    reader: Arc<dyn ResourceReader>,
}

impl CrashPredictor {
    /// Create a predictor with thresholds from the supervisor config.
    pub fn new(config: &SupervisorConfig, reader: Arc<dyn ResourceReader>) -> Self {
        Self {
            history: DashMap::new(),
            history_capacity: config.failure_history_capacity.max(1),
            block_threshold: config.failure_block_threshold,
            risky_threshold: config.failure_risky_threshold,
            critical_ratio: config.memory_critical_ratio,
            elevated_ratio: config.memory_elevated_ratio,
            reader,
        }
    }

    /// Classify a prospective operation.
    ///
    /// Decision order: known-bad pattern, then failure history, then live
    /// memory pressure, then safe. The first matching rule wins.
    pub fn predict(&self, descriptor: &str) -> CrashPrediction {
        if let Some(pattern) = KNOWN_BAD_PATTERNS
            .iter()
            .find(|pattern| descriptor.contains(**pattern))
        {
            return CrashPrediction::new(
                Verdict::Blocked,
                95,
                format!("descriptor matches known-bad pattern '{}'", pattern),
            );
        }

        let failures = self.failure_count(descriptor);
        if failures > self.block_threshold {
            return CrashPrediction::new(
                Verdict::Blocked,
                80,
                format!(
                    "{} recorded failures exceed block threshold {}",
                    failures, self.block_threshold
                ),
            );
        }
        if failures > self.risky_threshold {
            return CrashPrediction::new(
                Verdict::Risky,
                50,
                format!(
                    "{} recorded failures exceed risky threshold {}",
                    failures, self.risky_threshold
                ),
            );
        }

        let ratio = self.reader.memory_ratio();
        if ratio > self.critical_ratio {
            return CrashPrediction::new(
                Verdict::Blocked,
                90,
                format!("memory ratio {:.2} above critical {:.2}", ratio, self.critical_ratio),
            );
        }
        if ratio > self.elevated_ratio {
            return CrashPrediction::new(
                Verdict::Risky,
                40,
                format!("memory ratio {:.2} above elevated {:.2}", ratio, self.elevated_ratio),
            );
        }

        CrashPrediction::new(Verdict::Safe, 0, "no risk signals")
    }

    /// Record a crash against a descriptor.
    pub fn record_crash(&self, descriptor: &str) {
        if !self.history.contains_key(descriptor) && self.history.len() >= self.history_capacity {
            self.evict_one();
        }

        let mut count = self.history.entry(descriptor.to_string()).or_insert(0);
        *count += 1;
        debug!("Recorded crash for '{}' (count {})", descriptor, *count);
    }

    /// Record a success against a descriptor, decaying its failure count.
    ///
    /// One success undoes one crash, floored at zero; a unit can earn back
    /// trust over time.
    pub fn record_success(&self, descriptor: &str) {
        if let Some(mut count) = self.history.get_mut(descriptor) {
            *count = count.saturating_sub(1);
        }
    }

    /// The recorded failure count for a descriptor.
    pub fn failure_count(&self, descriptor: &str) -> u32 {
        self.history
            .get(descriptor)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Evict the least-implicated descriptor from history.
    ///
    /// Deterministic: the entry with the lowest count goes first, ties broken
    /// by lexicographic order.
    fn evict_one(&self) {
        let victim = self
            .history
            .iter()
            .map(|entry| (*entry.value(), entry.key().clone()))
            .min();

        if let Some((_, key)) = victim {
            self.history.remove(&key);
            debug!("Evicted '{}' from failure history", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::StaticResourceReader;

    fn predictor_with_ratio(current: u64, max: u64) -> CrashPredictor {
        let config = SupervisorConfig::default();
        let reader = Arc::new(StaticResourceReader::new(current, max));
        CrashPredictor::new(&config, reader)
    }

    #[test]
    fn test_known_bad_pattern_blocks_at_95() {
        let predictor = predictor_with_ratio(0, 1000);

        let prediction = predictor.predict("ext.foo:deadlock_detected:handler");
        assert_eq!(prediction.verdict, Verdict::Blocked);
        assert_eq!(prediction.confidence, 95);
        assert!(prediction.reason.contains("deadlock_detected"));
    }

    #[test]
    fn test_failure_history_thresholds() {
        let predictor = predictor_with_ratio(0, 1000);
        let descriptor = "ext.bar:tick";

        assert_eq!(predictor.predict(descriptor).verdict, Verdict::Safe);

        for _ in 0..3 {
            predictor.record_crash(descriptor);
        }
        let prediction = predictor.predict(descriptor);
        assert_eq!(prediction.verdict, Verdict::Risky);
        assert_eq!(prediction.confidence, 50);

        for _ in 0..3 {
            predictor.record_crash(descriptor);
        }
        let prediction = predictor.predict(descriptor);
        assert_eq!(prediction.verdict, Verdict::Blocked);
        assert_eq!(prediction.confidence, 80);
    }

    #[test]
    fn test_memory_pressure_thresholds() {
        let critical = predictor_with_ratio(970, 1000);
        let prediction = critical.predict("anything");
        assert_eq!(prediction.verdict, Verdict::Blocked);
        assert_eq!(prediction.confidence, 90);

        let elevated = predictor_with_ratio(900, 1000);
        let prediction = elevated.predict("anything");
        assert_eq!(prediction.verdict, Verdict::Risky);
        assert_eq!(prediction.confidence, 40);

        let calm = predictor_with_ratio(100, 1000);
        assert_eq!(calm.predict("anything").verdict, Verdict::Safe);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let predictor = predictor_with_ratio(900, 1000);
        predictor.record_crash("ext.baz:update");

        let first = predictor.predict("ext.baz:update");
        for _ in 0..10 {
            let again = predictor.predict("ext.baz:update");
            assert_eq!(again.verdict, first.verdict);
            assert_eq!(again.confidence, first.confidence);
            assert_eq!(again.reason, first.reason);
        }
    }

    #[test]
    fn test_success_decays_failures_floored_at_zero() {
        let predictor = predictor_with_ratio(0, 1000);
        let descriptor = "ext.qux:render";

        predictor.record_crash(descriptor);
        assert_eq!(predictor.failure_count(descriptor), 1);

        predictor.record_success(descriptor);
        assert_eq!(predictor.failure_count(descriptor), 0);

        predictor.record_success(descriptor);
        predictor.record_success("never-seen");
        assert_eq!(predictor.failure_count(descriptor), 0);
        assert_eq!(predictor.failure_count("never-seen"), 0);
    }

    #[test]
    fn test_history_is_bounded_with_deterministic_eviction() {
        let config = SupervisorConfig {
            failure_history_capacity: 3,
            ..Default::default()
        };
        let reader = Arc::new(StaticResourceReader::new(0, 1000));
        let predictor = CrashPredictor::new(&config, reader);

        predictor.record_crash("a");
        predictor.record_crash("b");
        predictor.record_crash("b");
        predictor.record_crash("c");
        assert_eq!(predictor.history.len(), 3);

        // "a" has the lowest count and the smallest key; it goes first
        predictor.record_crash("d");
        assert_eq!(predictor.history.len(), 3);
        assert_eq!(predictor.failure_count("a"), 0);
        assert_eq!(predictor.failure_count("b"), 2);
        assert_eq!(predictor.failure_count("d"), 1);
    }

    #[test]
    fn test_pattern_check_precedes_memory_check() {
        // Even under critical pressure the pattern reason wins
        let predictor = predictor_with_ratio(999, 1000);
        let prediction = predictor.predict("mod:stack_overflow");
        assert_eq!(prediction.confidence, 95);
    }
}
