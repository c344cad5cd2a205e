//! The dedicated single worker behind an isolator.

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::IsolationError;

/// A queued unit of work.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long shutdown waits for the worker thread before detaching it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// A single dedicated worker thread with a bounded submission queue.
///
/// Strictly serial: jobs run one at a time in submission order. The worker
/// tracks when its current job started so the health loop can spot a blocked
/// worker.
pub(crate) struct UnitWorker {
    unit_id: String,

    /// Sender side of the job queue; dropped on shutdown to close the queue
    sender: Mutex<Option<Sender<Job>>>,

    /// The worker thread handle
    handle: Mutex<Option<JoinHandle<()>>>,

    /// Set once shutdown begins
    shutting_down: Arc<AtomicBool>,

    /// When the currently running job started, if any
    busy_since: Arc<Mutex<Option<Instant>>>,
}

impl UnitWorker {
    /// Spawn the worker thread for a unit.
    pub(crate) fn spawn(unit_id: &str, queue_size: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue_size.max(1));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let busy_since = Arc::new(Mutex::new(None));

        let thread_name = format!("aegis-unit-{}", unit_id);
        let loop_shutdown = shutting_down.clone();
        let loop_busy = busy_since.clone();
        let loop_unit = unit_id.to_string();

        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                debug!("Worker started for unit {}", loop_unit);

                for job in receiver.iter() {
                    // Mark the job held before the shutdown check so any
                    // observer sees an accurate busy reading.
                    *loop_busy.lock() = Some(Instant::now());
                    if loop_shutdown.load(Ordering::Acquire) {
                        *loop_busy.lock() = None;
                        break;
                    }

                    // Jobs carry their own panic capture; this guard only
                    // keeps a stray panic from killing the worker loop.
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Job panicked past its own guard in unit {}", loop_unit);
                    }
                    *loop_busy.lock() = None;
                }

                debug!("Worker stopped for unit {}", loop_unit);
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("Failed to spawn worker for unit {}: {}", unit_id, err);
                None
            }
        };

        Self {
            unit_id: unit_id.to_string(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(handle),
            shutting_down,
            busy_since,
        }
    }

    /// Queue a job for the worker.
    pub(crate) fn submit(&self, job: Job) -> Result<(), IsolationError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(IsolationError::Shutdown(self.unit_id.clone()));
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(IsolationError::Shutdown(self.unit_id.clone()));
        };

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(IsolationError::QueueFull(self.unit_id.clone())),
            Err(TrySendError::Disconnected(_)) => {
                Err(IsolationError::Shutdown(self.unit_id.clone()))
            }
        }
    }

    /// How long the current job has been running, if one is running.
    pub(crate) fn busy_for(&self) -> Option<Duration> {
        (*self.busy_since.lock()).map(|since| since.elapsed())
    }

    /// Stop the worker.
    ///
    /// Idempotent. Closes the queue so pending jobs are dropped, waits a
    /// short grace period for the worker thread to exit, then detaches it.
    /// A runaway job cannot be interrupted and must never extend the
    /// caller's shutdown.
    pub(crate) fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the sender closes the queue and ends the worker loop
        self.sender.lock().take();

        if let Some(handle) = self.handle.lock().take() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            if handle.is_finished() {
                let _ = handle.join();
            } else {
                info!(
                    "Worker for unit {} is mid-job at shutdown; detaching",
                    self.unit_id
                );
            }
        }
    }
}

impl Drop for UnitWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
