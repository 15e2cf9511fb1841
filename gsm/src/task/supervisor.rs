//! The supervisor that runs a driver's work inside the common task shape.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::config::DEFAULT_LOCK_TIMEOUT_SECS;
use crate::lock::{LockError, LockService};
use crate::rpc::{Liveness, LivenessStatus, ReplySub, RequestEnvelope};

use super::record::{TaskRecord, TaskState};
use super::registry::TaskRegistry;

/// Failures surfaced to the requester as an `error` message.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The request is missing or carries an invalid field.
    #[error("{0}")]
    Validation(String),

    /// A lock operation failed.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// The requested operation is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Driver-specific failure.
    #[error("{0}")]
    Failed(String),
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work ran to completion.
    Completed,
    /// Work stopped in response to a cancel request.
    Canceled,
}

impl TaskOutcome {
    /// Wire spelling of the `finalStatus` reason.
    pub fn reason(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Canceled => "canceled",
        }
    }
}

/// Handles a worker uses to stream results and observe cancellation.
pub struct TaskContext {
    /// Raw output lines; forwarded to the bus and into the output ring.
    pub output: mpsc::UnboundedSender<String>,
    /// Structured progress; forwarded to the bus and the progress snapshot.
    pub progress: mpsc::UnboundedSender<serde_json::Value>,
    /// Cooperative cancellation. Workers must honor it within two seconds.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Emit one output line (delivery is best-effort).
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.output.send(line.into());
    }

    /// Emit a structured progress payload.
    pub fn progress(&self, value: serde_json::Value) {
        let _ = self.progress.send(value);
    }
}

/// Driver-specific work executed under supervision.
pub trait TaskWorker: Send + 'static {
    /// Run the work. Return [`TaskOutcome::Canceled`] after observing
    /// `ctx.cancel`; any error becomes the exchange's `error` message.
    fn run(self, ctx: TaskContext) -> impl Future<Output = Result<TaskOutcome, TaskError>> + Send;
}

/// Lock requirements and identity of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Dedup key (game id for downloads, instance id for repo fetches).
    pub key: String,
    /// The driver's own lock, held for the duration of the task.
    pub own_lock: String,
    /// Patterns that must be clear before the work may start.
    pub wait_patterns: Vec<String>,
    /// Budget for the own-lock acquisition and each pattern wait.
    pub lock_budget: Duration,
}

impl TaskSpec {
    pub fn new(key: impl Into<String>, own_lock: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            own_lock: own_lock.into(),
            wait_patterns: Vec::new(),
            lock_budget: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    pub fn wait_for(mut self, pattern: impl Into<String>) -> Self {
        self.wait_patterns.push(pattern.into());
        self
    }

    pub fn lock_budget(mut self, budget: Duration) -> Self {
        self.lock_budget = budget;
        self
    }
}

/// Runs tasks for one manager module.
pub struct TaskSupervisor {
    bus: Arc<MessageBus>,
    locks: Arc<LockService>,
    registry: Arc<TaskRegistry>,
    liveness: Arc<Liveness>,
}

impl TaskSupervisor {
    pub fn new(
        bus: Arc<MessageBus>,
        locks: Arc<LockService>,
        registry: Arc<TaskRegistry>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            bus,
            locks,
            registry,
            liveness,
        }
    }

    /// The registry backing this supervisor.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run `worker` for `request` under the common task shape.
    ///
    /// Never returns an error: every failure is converted into a bus
    /// message on the request's reply channel.
    pub async fn run<W: TaskWorker>(&self, request: RequestEnvelope, spec: TaskSpec, worker: W) {
        // Dedup: a second request for the same key joins the running task.
        let record = Arc::new(Mutex::new(TaskRecord::new(request.clone())));
        if let Err(existing) = self.registry.insert(&spec.key, Arc::clone(&record)) {
            info!(key = %spec.key, "duplicate request deflected");
            self.publish(
                &request,
                ReplySub::Nack,
                json!({
                    "alreadyRequested": true,
                    "subscribeTo": existing,
                }),
            );
            return;
        }

        // The driver's own lock.
        if let Err(e) = self.locks.spin_acquire(&spec.own_lock, spec.lock_budget).await {
            error!(key = %spec.key, lock = %spec.own_lock, "own lock not acquired: {e}");
            self.publish(&request, ReplySub::Error, json!({ "message": e.to_string() }));
            self.registry.remove(&spec.key);
            self.liveness.set_status(LivenessStatus::Error);
            return;
        }

        // Cross-task preconditions. On timeout the own lock is retained on
        // purpose: an operator has to look at why the peer never released.
        for pattern in &spec.wait_patterns {
            let wait = self
                .locks
                .wait_clear(pattern, spec.lock_budget, Duration::from_secs(1))
                .await;
            if let Err(e) = wait {
                error!(key = %spec.key, pattern, "precondition wait failed: {e}");
                self.publish(&request, ReplySub::Error, json!({ "message": e.to_string() }));
                self.registry.remove(&spec.key);
                self.liveness.set_status(LivenessStatus::Error);
                return;
            }
        }

        set_state(&record, TaskState::Preparing);

        // Stream plumbing: worker output/progress fan out to the bus and
        // into the record.
        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let output_forwarder = self.spawn_output_forwarder(&request, &record, output_rx);
        let progress_forwarder = self.spawn_progress_forwarder(&request, &record, progress_rx);

        self.publish(
            &request,
            ReplySub::Ack,
            json!({ "subscribeTo": request.reply_to }),
        );

        set_state(&record, TaskState::Running);
        self.liveness.set_status(LivenessStatus::Working);

        let cancel = record.lock().expect("task record poisoned").cancel.clone();
        let ctx = TaskContext {
            output: output_tx,
            progress: progress_tx,
            cancel,
        };
        let result = worker.run(ctx).await;

        // The context (and with it the stream senders) is gone; drain the
        // forwarders so residual lines land before the terminal message.
        let _ = output_forwarder.await;
        let _ = progress_forwarder.await;

        match result {
            Ok(outcome) => {
                let state = match outcome {
                    TaskOutcome::Completed => TaskState::Completed,
                    TaskOutcome::Canceled => TaskState::Canceled,
                };
                set_state(&record, state);
                debug!(key = %spec.key, reason = outcome.reason(), "task finished");
                self.publish(
                    &request,
                    ReplySub::FinalStatus,
                    json!({ "reason": outcome.reason(), "key": spec.key }),
                );
                self.liveness.set_status(LivenessStatus::Ready);
            }
            Err(e) => {
                set_state(&record, TaskState::Failed);
                let last_output = record
                    .lock()
                    .expect("task record poisoned")
                    .last_output()
                    .map(|s| s.to_string());
                warn!(key = %spec.key, "task failed: {e}");
                self.publish(
                    &request,
                    ReplySub::Error,
                    json!({ "message": e.to_string(), "lastOutput": last_output }),
                );
                self.liveness.set_status(LivenessStatus::Error);
            }
        }

        if let Err(e) = self.locks.release(&spec.own_lock) {
            warn!(lock = %spec.own_lock, "release failed: {e}");
        }
        self.registry.remove(&spec.key);
    }

    /// Reject a request before any record or lock exists.
    pub fn reject(&self, request: &RequestEnvelope, error: &TaskError) {
        self.publish(
            request,
            ReplySub::Error,
            json!({ "message": error.to_string() }),
        );
    }

    /// Request cancellation of the task for `key` and wait for it to wind
    /// down (registry entry removed by the supervising `run`).
    ///
    /// Returns `false` when no task for `key` is in flight.
    pub async fn cancel_and_wait(&self, key: &str, budget: Duration) -> bool {
        if self.registry.cancel(key).is_none() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + budget;
        while self.registry.contains(key) {
            if tokio::time::Instant::now() >= deadline {
                warn!(key, "task did not wind down within {budget:?}");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    fn spawn_output_forwarder(
        &self,
        request: &RequestEnvelope,
        record: &Arc<Mutex<TaskRecord>>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let record = Arc::clone(record);
        let topic = request.reply_topic(ReplySub::Output);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                record
                    .lock()
                    .expect("task record poisoned")
                    .push_output(line.clone());
                if let Err(e) = bus.publish(&topic, json!({ "line": line })) {
                    warn!("output publish failed: {e}");
                }
            }
        })
    }

    fn spawn_progress_forwarder(
        &self,
        request: &RequestEnvelope,
        record: &Arc<Mutex<TaskRecord>>,
        mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let record = Arc::clone(record);
        let topic = request.reply_topic(ReplySub::Progress);
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                record
                    .lock()
                    .expect("task record poisoned")
                    .last_progress = Some(value.clone());
                if let Err(e) = bus.publish(&topic, value) {
                    warn!("progress publish failed: {e}");
                }
            }
        })
    }

    fn publish(&self, request: &RequestEnvelope, sub: ReplySub, payload: serde_json::Value) {
        let topic = request.reply_topic(sub);
        if let Err(e) = self.bus.publish(&topic, payload) {
            error!(topic, "reply publish failed: {e}");
        }
    }
}

fn set_state(record: &Arc<Mutex<TaskRecord>>, state: TaskState) {
    record.lock().expect("task record poisoned").state = state;
}
