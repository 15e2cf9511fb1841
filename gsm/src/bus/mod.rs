//! Filesystem-backed pub/sub message bus.
//!
//! Every message is one JSON file in the shared bus directory (recommended
//! on tmpfs). Publishing writes the file atomically (temp name + rename);
//! every process runs a watcher task that polls the directory and delivers
//! new files to its in-process subscribers.
//!
//! # Guarantees
//!
//! - Delivery is best-effort: messages published while no watcher is
//!   running are lost. Establish the subscriber *before* issuing a request
//!   that replies to it.
//! - Per `(publisher, topic)` delivery is in order: file names embed a
//!   millisecond timestamp and a per-process sequence number, and the
//!   watcher processes files in lexical order.
//! - Across publishers there is no ordering guarantee.
//!
//! # Hygiene
//!
//! Each bus sweeps its own messages after [`MESSAGE_TTL`] and removes any
//! orphaned message (e.g. from a crashed publisher) after
//! [`ORPHAN_TTL`]. Subscribers have long consumed files of that age.

mod topic;

pub use topic::topic_matches;

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// How often the watcher scans the bus directory.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a publisher keeps its own delivered messages on disk.
const MESSAGE_TTL: Duration = Duration::from_secs(30);

/// After this age any message file is fair game for removal.
const ORPHAN_TTL: Duration = Duration::from_secs(300);

/// Errors raised by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A message as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Dotted topic string.
    pub topic: String,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
    /// PID of the publishing process.
    pub publisher_pid: u32,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct BusInner {
    dir: PathBuf,
    seq: AtomicU64,
    next_sub_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// An active subscription.
///
/// Dropping the subscription stops delivery; the registry entry is pruned
/// lazily on the next matching message.
pub struct Subscription {
    /// Id usable with [`MessageBus::unsubscribe`].
    pub id: u64,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Receive the next matching message.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Receive with a timeout; `Ok(None)` means the bus shut down.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<BusMessage>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.rx.recv()).await
    }
}

/// Handle to the message bus for one process.
pub struct MessageBus {
    inner: Arc<BusInner>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Open the bus at `dir` and start the watcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BusError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let inner = Arc::new(BusInner {
            dir,
            seq: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let watcher_inner = Arc::clone(&inner);
        let watcher_cancel = cancel.clone();
        let watcher = tokio::spawn(async move {
            watch_loop(watcher_inner, watcher_cancel).await;
        });

        Ok(Self {
            inner,
            cancel,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Publish `payload` on `topic`. Fire-and-forget: delivery is not
    /// confirmed, but the write itself can fail.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            publisher_pid: std::process::id(),
            timestamp: Utc::now(),
        };
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{:013}-{:010}-{:06}.json",
            now_millis(),
            message.publisher_pid,
            seq
        );

        // Write to a dot-prefixed temp name first so the watcher never sees
        // a partially written file, then rename into place (atomic on the
        // same filesystem).
        let tmp = self.inner.dir.join(format!(".{name}"));
        let dest = self.inner.dir.join(&name);
        fs::write(&tmp, serde_json::to_vec(&message)?)?;
        fs::rename(&tmp, &dest)?;
        trace!(topic, file = %name, "published");
        Ok(())
    }

    /// Subscribe to every topic matching `pattern` (see [`topic_matches`]).
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .push(Subscriber {
                id,
                pattern: pattern.to_string(),
                tx,
            });
        trace!(pattern, id, "subscribed");
        Subscription { id, rx }
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .retain(|s| s.id != id);
    }

    /// Remove all subscriptions of this process.
    pub fn unsubscribe_all(&self) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .clear();
    }

    /// Shut the bus down cleanly for an exiting process.
    ///
    /// Stops the watcher; pending subscriptions see end-of-stream.
    /// Idempotent.
    pub async fn stop_watching(&self) {
        self.cancel.cancel();
        let handle = self
            .watcher
            .lock()
            .expect("watcher handle poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("bus watcher task failed: {e}");
            }
        }
        self.unsubscribe_all();
    }
}

async fn watch_loop(inner: Arc<BusInner>, cancel: CancellationToken) {
    let mut seen: HashSet<String> = HashSet::new();
    // Only messages published at or after watcher start are delivered.
    let start_prefix = format!("{:013}", now_millis());
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        ticks += 1;

        let mut names = match list_message_files(&inner.dir) {
            Ok(names) => names,
            Err(e) => {
                warn!("bus directory scan failed: {e}");
                continue;
            }
        };
        names.sort();

        let horizon = now_millis().saturating_sub(ORPHAN_TTL.as_millis() as u64);
        for name in names {
            if name.as_str() < start_prefix.as_str() {
                continue;
            }
            if file_millis(&name).unwrap_or(0) < horizon {
                continue;
            }
            if !seen.insert(name.clone()) {
                continue;
            }
            let path = inner.dir.join(&name);
            let message: BusMessage = match fs::read(&path)
                .map_err(BusError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(BusError::from))
            {
                Ok(message) => message,
                Err(e) => {
                    trace!(file = %name, "skipping unreadable message: {e}");
                    continue;
                }
            };
            dispatch(&inner, message);
        }

        // Housekeeping roughly every 5 s: drop stale dedup entries and
        // sweep expired files.
        if ticks % 50 == 0 {
            seen.retain(|name| file_millis(name).unwrap_or(0) >= horizon);
            sweep(&inner.dir);
        }
    }
}

fn dispatch(inner: &BusInner, message: BusMessage) {
    let mut subscribers = inner
        .subscribers
        .lock()
        .expect("subscriber registry poisoned");
    subscribers.retain(|sub| {
        if !topic_matches(&sub.pattern, &message.topic) {
            return true;
        }
        // A closed receiver means the Subscription was dropped; prune it.
        sub.tx.send(message.clone()).is_ok()
    });
}

fn sweep(dir: &PathBuf) {
    let own_pid = std::process::id();
    let own_horizon = now_millis().saturating_sub(MESSAGE_TTL.as_millis() as u64);
    let orphan_horizon = now_millis().saturating_sub(ORPHAN_TTL.as_millis() as u64);

    let Ok(names) = list_message_files(dir) else {
        return;
    };
    for name in names {
        let Some(millis) = file_millis(&name) else {
            continue;
        };
        let own = file_pid(&name) == Some(own_pid);
        if (own && millis < own_horizon) || millis < orphan_horizon {
            let _ = fs::remove_file(dir.join(&name));
        }
    }
}

fn list_message_files(dir: &PathBuf) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn file_millis(name: &str) -> Option<u64> {
    name.get(0..13)?.parse().ok()
}

fn file_pid(name: &str) -> Option<u32> {
    name.get(14..24)?.parse().ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
