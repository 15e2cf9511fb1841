//! The per-module registry of in-flight tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::record::{TaskRecord, TaskSnapshot};

/// In-flight tasks keyed by task key (game id or instance id).
///
/// Enforces the dedup invariant: insertion fails when a record for the key
/// already exists, returning the existing task's reply channel so the
/// caller can deflect the duplicate requester onto it.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskRecord>>>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new task. On conflict returns the existing task's
    /// `replyTo` as the error value.
    pub fn insert(&self, key: &str, record: Arc<Mutex<TaskRecord>>) -> Result<(), String> {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        if let Some(existing) = tasks.get(key) {
            let reply_to = existing
                .lock()
                .expect("task record poisoned")
                .request
                .reply_to
                .clone();
            return Err(reply_to);
        }
        tasks.insert(key.to_string(), record);
        Ok(())
    }

    /// The reply channel of the in-flight task for `key`, if any.
    pub fn reply_to(&self, key: &str) -> Option<String> {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.get(key).map(|record| {
            record
                .lock()
                .expect("task record poisoned")
                .request
                .reply_to
                .clone()
        })
    }

    /// Fetch a task record.
    pub fn get(&self, key: &str) -> Option<Arc<Mutex<TaskRecord>>> {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .get(key)
            .cloned()
    }

    /// Remove a task record (terminal status emitted, or setup failed).
    pub fn remove(&self, key: &str) {
        self.tasks.lock().expect("task registry poisoned").remove(key);
    }

    /// Whether a task for `key` is in flight.
    pub fn contains(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .contains_key(key)
    }

    /// Request cancellation of the task for `key`.
    ///
    /// Returns the task's cancellation token when found; the worker honors
    /// it cooperatively and the supervisor emits the terminal status.
    pub fn cancel(&self, key: &str) -> Option<CancellationToken> {
        let record = self.get(key)?;
        let mut record = record.lock().expect("task record poisoned");
        record.cancel_requested = true;
        debug!(key, "cancel requested");
        let token = record.cancel.clone();
        token.cancel();
        Some(token)
    }

    /// Snapshots of all in-flight tasks, sorted by key.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        let mut snapshots: Vec<TaskSnapshot> = tasks
            .iter()
            .map(|(key, record)| {
                let record = record.lock().expect("task record poisoned");
                TaskSnapshot {
                    key: key.clone(),
                    state: record.state,
                    created_at: record.created_at,
                    reply_to: record.request.reply_to.clone(),
                    last_progress: record.last_progress.clone(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RequestEnvelope;

    fn record() -> Arc<Mutex<TaskRecord>> {
        Arc::new(Mutex::new(TaskRecord::new(RequestEnvelope::new(
            "tester",
            serde_json::Map::new(),
        ))))
    }

    #[test]
    fn test_insert_is_exclusive_per_key() {
        let registry = TaskRegistry::new();
        let first = record();
        let first_reply = first
            .lock()
            .unwrap()
            .request
            .reply_to
            .clone();

        registry.insert("csgo", first).unwrap();
        let existing = registry.insert("csgo", record()).unwrap_err();
        assert_eq!(existing, first_reply);

        // A different key is fine.
        registry.insert("tf2", record()).unwrap();
    }

    #[test]
    fn test_remove_allows_reinsert() {
        let registry = TaskRegistry::new();
        registry.insert("csgo", record()).unwrap();
        registry.remove("csgo");
        registry.insert("csgo", record()).unwrap();
    }

    #[test]
    fn test_cancel_fires_token() {
        let registry = TaskRegistry::new();
        let rec = record();
        let token = rec.lock().unwrap().cancel.clone();
        registry.insert("csgo", rec).unwrap();

        assert!(!token.is_cancelled());
        registry.cancel("csgo").unwrap();
        assert!(token.is_cancelled());

        assert!(registry.cancel("missing").is_none());
    }

    #[test]
    fn test_snapshots_sorted() {
        let registry = TaskRegistry::new();
        registry.insert("tf2", record()).unwrap();
        registry.insert("csgo", record()).unwrap();

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].key, "csgo");
        assert_eq!(snapshots[1].key, "tf2");
    }
}
