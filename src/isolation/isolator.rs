//! The per-unit execution sandbox.

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, IsolationError, Result};
use crate::isolation::worker::UnitWorker;
use crate::resource::ResourceReader;

/// The error type supervised actions may return.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked whenever a unit's action fails.
///
/// Receives the unit ID and the failure. Called on the submitting thread,
/// never inside the worker.
pub type CrashHandler = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Settings for a single isolator.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    /// Memory ceiling for the unit, in bytes
    pub memory_ceiling_bytes: u64,

    /// Wall-clock timeout per call
    pub call_timeout: Duration,

    /// Capacity of the submission queue
    pub queue_size: usize,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 256 * 1024 * 1024,
            call_timeout: Duration::from_secs(30),
            queue_size: 64,
        }
    }
}

/// Runs one unit's actions on a dedicated single worker, bounded by a memory
/// ceiling and a wall-clock timeout.
///
/// Every failure — the action's own error, a panic, a timeout, or the
/// fail-fast memory check — is forwarded to the crash handler and returned
/// to the caller as a typed error. Nothing is ever silently dropped, and
/// nothing ever runs on a shared pool where it could affect another unit.
pub struct ExecutionIsolator {
    unit_id: String,
    config: IsolatorConfig,
    reader: Arc<dyn ResourceReader>,

    /// The dedicated worker, spawned on first use so that contexts created
    /// only to be torn down (quarantine of a never-run unit) cost no thread
    worker: OnceCell<UnitWorker>,

    crash_handler: CrashHandler,
    shut_down: AtomicBool,
}

impl ExecutionIsolator {
    /// Create an isolator for a unit.
    ///
    /// # Arguments
    ///
    /// * `unit_id` - The unit this isolator belongs to.
    /// * `config` - Ceiling, timeout, and queue settings.
    /// * `reader` - The host-supplied resource reader.
    /// * `crash_handler` - Invoked with every failure before it is returned.
    pub fn new(
        unit_id: impl Into<String>,
        config: IsolatorConfig,
        reader: Arc<dyn ResourceReader>,
        crash_handler: CrashHandler,
    ) -> Self {
        let unit_id = unit_id.into();

        info!(
            "Isolation context created for unit {} (ceiling {} bytes, timeout {}ms)",
            unit_id,
            config.memory_ceiling_bytes,
            config.call_timeout.as_millis()
        );

        Self {
            unit_id,
            config,
            reader,
            worker: OnceCell::new(),
            crash_handler,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The unit this isolator belongs to.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Run a side-effecting action inside the sandbox.
    pub fn execute<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_with_result(move || {
            action();
            Ok(())
        })
    }

    /// Run an action inside the sandbox and return its result.
    ///
    /// Fails fast with `ResourceExceeded` if process memory is already over
    /// the unit's ceiling — the action body is never invoked in that case.
    /// Enforces the configured wall-clock timeout on the call; a timed-out
    /// action is treated identically to a crashed one.
    pub fn execute_with_result<T, F>(&self, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, ActionError> + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(IsolationError::Shutdown(self.unit_id.clone()).into());
        }

        let used = self.reader.current_memory();
        if used >= self.config.memory_ceiling_bytes {
            return Err(self.report(
                IsolationError::ResourceExceeded {
                    used_bytes: used,
                    ceiling_bytes: self.config.memory_ceiling_bytes,
                }
                .into(),
            ));
        }

        let (result_tx, result_rx) = bounded(1);
        let job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(action));
            // The receiver may have timed out and gone away
            let _ = result_tx.send(outcome);
        });

        let worker = self
            .worker
            .get_or_init(|| UnitWorker::spawn(&self.unit_id, self.config.queue_size));
        if self.shut_down.load(Ordering::Acquire) {
            // Shut down while the worker was being spawned; tear it down
            // again so the late spawn cannot outlive the context
            worker.shutdown();
            return Err(IsolationError::Shutdown(self.unit_id.clone()).into());
        }

        if let Err(err) = worker.submit(job) {
            return Err(self.report(err.into()));
        }

        match result_rx.recv_timeout(self.config.call_timeout) {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(action_err))) => Err(self.report(
                IsolationError::ActionFailed(action_err.to_string()).into(),
            )),
            Ok(Err(payload)) => Err(self.report(
                IsolationError::ActionPanicked(panic_message(payload)).into(),
            )),
            Err(RecvTimeoutError::Timeout) => Err(self.report(
                IsolationError::Timeout(self.config.call_timeout.as_millis() as u64).into(),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.report(IsolationError::Shutdown(self.unit_id.clone()).into()))
            }
        }
    }

    /// How long the worker has been stuck in its current job, if it is busy.
    pub fn busy_for(&self) -> Option<Duration> {
        self.worker.get().and_then(|worker| worker.busy_for())
    }

    /// Tear the isolation context down.
    ///
    /// Idempotent. Stops accepting submissions and drops pending work; a
    /// job already running is detached, since it cannot be interrupted.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Isolation context shut down for unit {}", self.unit_id);
        if let Some(worker) = self.worker.get() {
            worker.shutdown();
        }
    }

    /// Forward a failure to the crash handler, then hand it back.
    fn report(&self, err: Error) -> Error {
        warn!("Unit {} failed: {}", self.unit_id, err);
        (self.crash_handler)(&self.unit_id, &err);
        err
    }
}

impl Drop for ExecutionIsolator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Render a panic payload as a readable message.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::StaticResourceReader;
    use parking_lot::Mutex;
    use std::thread;

    struct Harness {
        isolator: ExecutionIsolator,
        crashes: Arc<Mutex<Vec<String>>>,
        reader: Arc<StaticResourceReader>,
    }

    fn harness(config: IsolatorConfig) -> Harness {
        let reader = Arc::new(StaticResourceReader::new(1000, 1_000_000));
        let crashes = Arc::new(Mutex::new(Vec::new()));

        let seen = crashes.clone();
        let handler: CrashHandler = Arc::new(move |unit_id, err| {
            seen.lock().push(format!("{}: {}", unit_id, err));
        });

        Harness {
            isolator: ExecutionIsolator::new("test-unit", config, reader.clone(), handler),
            crashes,
            reader,
        }
    }

    #[test]
    fn test_successful_execution_returns_value() {
        let h = harness(IsolatorConfig::default());

        let result = h.isolator.execute_with_result(|| Ok(6 * 7)).unwrap();
        assert_eq!(result, 42);
        assert!(h.crashes.lock().is_empty());
    }

    #[test]
    fn test_action_error_is_typed_and_forwarded() {
        let h = harness(IsolatorConfig::default());

        let err = h
            .isolator
            .execute_with_result::<(), _>(|| Err("extension misbehaved".into()))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Isolation(IsolationError::ActionFailed(_))
        ));
        assert_eq!(h.crashes.lock().len(), 1);
        assert!(h.crashes.lock()[0].contains("extension misbehaved"));
    }

    #[test]
    fn test_panic_is_caught_and_forwarded() {
        let h = harness(IsolatorConfig::default());

        let err = h
            .isolator
            .execute_with_result::<(), _>(|| panic!("wild pointer"))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Isolation(IsolationError::ActionPanicked(_))
        ));
        assert_eq!(h.crashes.lock().len(), 1);

        // The worker survives the panic
        assert_eq!(h.isolator.execute_with_result(|| Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_memory_ceiling_fails_fast_without_running_action() {
        let config = IsolatorConfig {
            memory_ceiling_bytes: 1,
            ..Default::default()
        };
        let h = harness(config);
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = ran.clone();
        let err = h
            .isolator
            .execute_with_result(move || {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Isolation(IsolationError::ResourceExceeded { .. })
        ));
        thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(h.crashes.lock().len(), 1);
    }

    #[test]
    fn test_timeout_is_enforced() {
        let config = IsolatorConfig {
            call_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config);

        let err = h
            .isolator
            .execute_with_result(|| {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::Isolation(IsolationError::Timeout(50))));
        assert_eq!(h.crashes.lock().len(), 1);
    }

    #[test]
    fn test_shutdown_fails_fast_without_crash_handler() {
        let h = harness(IsolatorConfig::default());
        h.isolator.shutdown();
        h.isolator.shutdown(); // idempotent

        let err = h.isolator.execute_with_result(|| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Isolation(IsolationError::Shutdown(_))));

        // Shutdown refusal is not a crash
        assert!(h.crashes.lock().is_empty());
    }

    #[test]
    fn test_teardown_before_first_call_is_cheap_and_final() {
        let h = harness(IsolatorConfig::default());

        // No call has happened, so no worker exists yet
        assert!(h.isolator.busy_for().is_none());
        h.isolator.shutdown();

        let err = h.isolator.execute_with_result(|| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Isolation(IsolationError::Shutdown(_))));
        assert!(h.isolator.busy_for().is_none());
        assert!(h.crashes.lock().is_empty());
    }

    #[test]
    fn test_memory_reading_recovers_after_pressure_drops() {
        let config = IsolatorConfig {
            memory_ceiling_bytes: 2000,
            ..Default::default()
        };
        let h = harness(config);

        h.reader.set_current(5000);
        assert!(h.isolator.execute_with_result(|| Ok(())).is_err());

        h.reader.set_current(100);
        assert!(h.isolator.execute_with_result(|| Ok(())).is_ok());
    }
}
