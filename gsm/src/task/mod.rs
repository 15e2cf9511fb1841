//! Generic task supervision shared by all drivers.
//!
//! Every driver (download, repo, overlay, game) runs requests through the
//! same shape: validate, deduplicate by task key, take the driver's own
//! lock, wait for cross-task pattern locks, ack, stream output/progress,
//! and finish with exactly one terminal message. The driver itself only
//! supplies a [`TaskWorker`] implementation with its specific work.
//!
//! # Invariants
//!
//! - At most one task record exists per key at any instant; a duplicate
//!   request is deflected onto the running task's reply channel via `nack`.
//! - Every acked request is closed by exactly one `finalStatus` or `error`.
//! - The per-task output ring never exceeds [`OUTPUT_RING_CAP`] lines.
//! - Locks are released on every exit path except a pattern-wait timeout,
//!   where the driver lock is deliberately retained for the operator.

mod record;
mod registry;
mod supervisor;

pub use record::{TaskRecord, TaskSnapshot, TaskState, OUTPUT_RING_CAP};
pub use registry::TaskRegistry;
pub use supervisor::{
    TaskContext, TaskError, TaskOutcome, TaskSpec, TaskSupervisor, TaskWorker,
};
