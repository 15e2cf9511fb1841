//! Ping/pong liveness for manager modules.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::bus::MessageBus;
use crate::rpc::RequestEnvelope;

/// Coarse module status reported in ping replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    /// Module is initializing.
    Starting,
    /// Module is idle and accepting requests.
    Ready,
    /// Module is executing a task.
    Working,
    /// The last task failed; the module still accepts requests.
    Error,
}

/// The payload of a ping reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    pub module_ident: String,
    pub pid: u32,
    pub uptime: f64,
    pub status: LivenessStatus,
    /// Resident set size in bytes; 0 when unavailable.
    pub resource_usage: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Shared liveness state for one module.
pub struct Liveness {
    module_ident: String,
    started: Instant,
    status: Mutex<LivenessStatus>,
}

impl Liveness {
    pub fn new(module_ident: impl Into<String>) -> Arc<Self> {
        Self::with_start(module_ident, Instant::now())
    }

    /// Liveness with an explicit start instant (tests backdate it to
    /// cross the readiness threshold immediately).
    pub fn with_start(module_ident: impl Into<String>, started: Instant) -> Arc<Self> {
        Arc::new(Self {
            module_ident: module_ident.into(),
            started,
            status: Mutex::new(LivenessStatus::Starting),
        })
    }

    /// Module identity as reported on the bus.
    pub fn module_ident(&self) -> &str {
        &self.module_ident
    }

    /// Update the reported status.
    pub fn set_status(&self, status: LivenessStatus) {
        *self.status.lock().expect("liveness status poisoned") = status;
    }

    /// Current status.
    pub fn status(&self) -> LivenessStatus {
        *self.status.lock().expect("liveness status poisoned")
    }

    /// Snapshot for a ping reply.
    pub fn snapshot(&self) -> PingReply {
        PingReply {
            module_ident: self.module_ident.clone(),
            pid: std::process::id(),
            uptime: self.started.elapsed().as_secs_f64(),
            status: self.status(),
            resource_usage: resident_set_bytes(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Background responder for `<module>.ping` and `_broadcast.ping`.
pub struct Pinger {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Pinger {
    /// Start answering pings for `liveness` on `bus`.
    pub fn spawn(bus: Arc<MessageBus>, liveness: Arc<Liveness>) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut direct = bus.subscribe(&format!("{}.ping", liveness.module_ident()));
            let mut broadcast = bus.subscribe("_broadcast.ping");
            loop {
                let message = tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    m = direct.recv() => m,
                    m = broadcast.recv() => m,
                };
                let Some(message) = message else { return };
                let Ok(envelope) = RequestEnvelope::from_value(&message.payload) else {
                    trace!(topic = %message.topic, "ignoring ping without envelope");
                    continue;
                };
                let reply = liveness.snapshot();
                if let Err(e) = bus.publish(&envelope.reply_to, json!(reply)) {
                    warn!("failed to publish ping reply: {e}");
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop answering pings.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resident set size of this process, from `/proc/self/statm`.
fn resident_set_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    // SAFETY: sysconf with a valid name has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * page_size.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let liveness = Liveness::new("downloadManager");
        assert_eq!(liveness.status(), LivenessStatus::Starting);

        liveness.set_status(LivenessStatus::Ready);
        assert_eq!(liveness.status(), LivenessStatus::Ready);

        liveness.set_status(LivenessStatus::Working);
        let snapshot = liveness.snapshot();
        assert_eq!(snapshot.status, LivenessStatus::Working);
        assert_eq!(snapshot.module_ident, "downloadManager");
        assert_eq!(snapshot.pid, std::process::id());
    }

    #[test]
    fn test_resource_usage_is_populated_on_linux() {
        let liveness = Liveness::new("m");
        let snapshot = liveness.snapshot();
        // On Linux /proc/self/statm is always readable; elsewhere 0 is fine.
        if std::path::Path::new("/proc/self/statm").exists() {
            assert!(snapshot.resource_usage > 0);
        }
    }

    #[tokio::test]
    async fn test_pinger_answers_direct_and_broadcast() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(tmp.path().join("ipc")).unwrap());
        let liveness = Liveness::new("downloadManager");
        liveness.set_status(LivenessStatus::Ready);
        let pinger = Pinger::spawn(Arc::clone(&bus), Arc::clone(&liveness));

        for ping_topic in ["downloadManager.ping", "_broadcast.ping"] {
            let envelope = RequestEnvelope::new("tester", serde_json::Map::new());
            let mut sub = bus.subscribe(&envelope.reply_to);
            bus.publish(ping_topic, serde_json::to_value(&envelope).unwrap())
                .unwrap();

            let message = sub
                .recv_timeout(std::time::Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            let reply: PingReply = serde_json::from_value(message.payload).unwrap();
            assert_eq!(reply.module_ident, "downloadManager");
            assert_eq!(reply.status, LivenessStatus::Ready);
        }

        pinger.stop().await;
        bus.stop_watching().await;
    }
}
