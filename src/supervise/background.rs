//! Supervised periodic background tasks.
//!
//! A background loop must never silently die: every tick runs under a panic
//! guard, and a failure inside one tick is caught, logged, and forgotten
//! before the next tick. Loops run on their own named threads and never
//! share a thread with caller code.

use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a sleeping loop re-checks its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

/// Handle to a running background loop.
pub(crate) struct LoopHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Stop the loop and wait for its thread to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("Background loop '{}' stopped", self.name);
    }
}

/// Spawn a supervised periodic loop.
///
/// `tick` runs once per `interval`. A panic inside a tick is caught and
/// logged; the loop always reaches its next tick.
pub(crate) fn spawn_supervised_loop<F>(
    name: &'static str,
    interval: Duration,
    mut tick: F,
) -> LoopHandle
where
    F: FnMut() + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = shutdown.clone();

    let handle = thread::Builder::new()
        .name(format!("aegis-{}", name))
        .spawn(move || {
            debug!("Background loop '{}' started", name);

            while !loop_shutdown.load(Ordering::Acquire) {
                if panic::catch_unwind(AssertUnwindSafe(|| tick())).is_err() {
                    error!("Background loop '{}' tick panicked; continuing", name);
                }

                // Sleep in short slices so shutdown stays responsive
                let deadline = Instant::now() + interval;
                loop {
                    if loop_shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    thread::sleep(SHUTDOWN_POLL.min(remaining));
                }
            }
        })
        .ok();

    LoopHandle {
        name,
        shutdown,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_loop_ticks_repeatedly() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = spawn_supervised_loop("tick-test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(120));
        handle.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_panicking_tick_does_not_kill_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = spawn_supervised_loop("panic-test", Duration::from_millis(10), move || {
            let tick = counter.fetch_add(1, Ordering::SeqCst);
            if tick % 2 == 0 {
                panic!("scheduled task blew up");
            }
        });

        thread::sleep(Duration::from_millis(120));
        handle.stop();

        // Ticks kept arriving after the panicking ones
        assert!(ticks.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_stop_is_prompt() {
        let handle = spawn_supervised_loop("stop-test", Duration::from_secs(3600), || {});

        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
