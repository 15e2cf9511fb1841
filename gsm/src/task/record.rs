//! Per-task state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::rpc::RequestEnvelope;

/// Cap on the retained tail of task output.
pub const OUTPUT_RING_CAP: usize = 1000;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    CheckingLocks,
    Preparing,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// The record of one in-flight task.
#[derive(Debug)]
pub struct TaskRecord {
    /// Originating request.
    pub request: RequestEnvelope,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Current state. Initialized before the record becomes visible in the
    /// registry so observers never see an unset state.
    pub state: TaskState,
    /// Most recent structured progress payload.
    pub last_progress: Option<serde_json::Value>,
    /// Newest-first ring of output lines, capped at [`OUTPUT_RING_CAP`].
    pub output_ring: VecDeque<String>,
    /// Failure message, when the task failed.
    pub error: Option<String>,
    /// Cooperative cancellation signal for the worker.
    pub cancel: CancellationToken,
    /// Whether a cancel was requested (distinguishes a canceled exit from
    /// a plain failure when the subprocess dies).
    pub cancel_requested: bool,
}

impl TaskRecord {
    pub fn new(request: RequestEnvelope) -> Self {
        Self {
            request,
            created_at: Utc::now(),
            state: TaskState::CheckingLocks,
            last_progress: None,
            output_ring: VecDeque::new(),
            error: None,
            cancel: CancellationToken::new(),
            cancel_requested: false,
        }
    }

    /// Record an output line, newest first, bounded.
    pub fn push_output(&mut self, line: String) {
        self.output_ring.push_front(line);
        self.output_ring.truncate(OUTPUT_RING_CAP);
    }

    /// Newest retained output line.
    pub fn last_output(&self) -> Option<&str> {
        self.output_ring.front().map(|s| s.as_str())
    }
}

/// Read-only view of a task for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub key: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub reply_to: String,
    pub last_progress: Option<serde_json::Value>,
}
