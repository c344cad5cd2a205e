//! Per-unit execution isolation.
//!
//! Each supervised unit gets its own [`ExecutionIsolator`]: a dedicated
//! single-worker thread with a bounded submission queue, a memory ceiling,
//! and a wall-clock timeout per call. One unit's infinite loop or runaway
//! allocation only exhausts its own queue and budget, bounded by the timeout
//! and ceiling — never another unit's. This is cooperative isolation, not OS
//! sandboxing.

mod isolator;
mod worker;

pub use isolator::{ActionError, CrashHandler, ExecutionIsolator, IsolatorConfig};
