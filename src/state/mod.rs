//! Shared-state ownership, snapshots, and rollback.
//!
//! This module owns the single piece of shared mutable state the whole
//! subsystem protects. [`StateManager`] is its exclusive owner: every read
//! and write goes through it, it captures bounded snapshot history, and it
//! performs rollback when the supervisor asks for recovery.

mod manager;
mod snapshot;

pub use manager::StateManager;
pub use snapshot::StateSnapshot;
