//! Lifecycle coordinator.
//!
//! Drives one instance from nothing to a running game in the fixed
//! dependency order: base download, config fetch, overlay mount, game
//! start. Each step is a request to the owning manager over the bus; the
//! coordinator waits for the manager's readiness first and converts every
//! failure into a distinct process exit code:
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | success / clean termination |
//! | 1    | self-lock or setup failure |
//! | 2    | module readiness timeout |
//! | 3    | download failed |
//! | 4    | config fetch failed |
//! | 5    | overlay mount failed |
//! | 6    | duplicate mount (`nack: alreadyMounted`) |

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::config::Settings;
use crate::lock::{LockError, LockName, LockService};
use crate::rpc::{self, PendingRequest, ReplyEvent, RpcError};
use crate::signals::SignalHub;

pub const EXIT_OK: i32 = 0;
pub const EXIT_SELF_LOCK: i32 = 1;
pub const EXIT_MODULE_TIMEOUT: i32 = 2;
pub const EXIT_DOWNLOAD_FAILED: i32 = 3;
pub const EXIT_CONFIG_FAILED: i32 = 4;
pub const EXIT_MOUNT_FAILED: i32 = 5;
pub const EXIT_ALREADY_MOUNTED: i32 = 6;

/// Identity used for `replyTo` channels of this process.
const IDENT: &str = "lifecycleManager";

/// Time budgets of the coordinator. The defaults follow the documented
/// contract; tests shrink them.
#[derive(Debug, Clone)]
pub struct LifecycleBudgets {
    /// Readiness wait for `downloadManager` (it is usually the first
    /// manager up after a host boot).
    pub download_ready: Duration,
    /// Readiness wait for every other manager.
    pub module_ready: Duration,
    /// Budget for the initial ack of each request.
    pub ack: Duration,
    /// Budget for a download/config task to finish.
    pub task: Duration,
}

impl Default for LifecycleBudgets {
    fn default() -> Self {
        Self {
            download_ready: Duration::from_secs(60),
            module_ready: Duration::from_secs(30),
            ack: Duration::from_secs(30),
            task: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// How a step's exchange ended.
enum StepOutcome {
    Completed,
    Failed(String),
    Canceled,
    AlreadyMounted,
}

/// The coordinator process.
pub struct LifecycleCoordinator {
    settings: Settings,
    bus: Arc<MessageBus>,
    locks: Arc<LockService>,
    hub: SignalHub,
    budgets: LifecycleBudgets,
    game_id: String,
    instance_id: String,
}

impl LifecycleCoordinator {
    /// Set up bus and locks. Returns `Err(exit_code)` when the
    /// environment is unusable.
    pub fn new(settings: Settings, hub: SignalHub) -> Result<Self, i32> {
        Self::with_budgets(settings, hub, LifecycleBudgets::default())
    }

    pub fn with_budgets(
        settings: Settings,
        hub: SignalHub,
        budgets: LifecycleBudgets,
    ) -> Result<Self, i32> {
        let game_id = match settings.require_game_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                error!("{e}");
                return Err(EXIT_SELF_LOCK);
            }
        };
        let instance_id = match settings.require_instance_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                error!("{e}");
                return Err(EXIT_SELF_LOCK);
            }
        };

        let bus = match MessageBus::new(settings.ipc_dir()) {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                error!("bus setup failed: {e}");
                return Err(EXIT_SELF_LOCK);
            }
        };
        let locks = match LockService::new(settings.lock_dir()) {
            Ok(locks) => Arc::new(locks),
            Err(e) => {
                error!("lock setup failed: {e}");
                return Err(EXIT_SELF_LOCK);
            }
        };

        Ok(Self {
            settings,
            bus,
            locks,
            hub,
            budgets,
            game_id,
            instance_id,
        })
    }

    /// Run the full sequence; returns the process exit code.
    pub async fn run(self) -> i32 {
        let lifecycle_lock = LockName::lifecycle(&self.game_id, &self.instance_id);
        match self.locks.acquire(&lifecycle_lock) {
            Ok(()) => {}
            Err(LockError::Busy { holder }) => {
                error!(holder, "another lifecycle coordinator drives this instance");
                return EXIT_SELF_LOCK;
            }
            Err(e) => {
                error!("lifecycle lock failed: {e}");
                return EXIT_SELF_LOCK;
            }
        }

        let shutdown = self.hub.shutdown_token();
        let code = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("termination requested, canceling in-flight work");
                self.cancel_in_flight();
                EXIT_OK
            }
            code = self.sequence() => code,
        };

        if let Err(e) = self.locks.release(&lifecycle_lock) {
            warn!("lifecycle lock release failed: {e}");
        }
        self.bus.stop_watching().await;
        code
    }

    async fn sequence(&self) -> i32 {
        info!(
            game_id = %self.game_id,
            instance_id = %self.instance_id,
            "lifecycle starting"
        );

        // 1. Base files.
        if let Err(code) = self.ready("downloadManager", self.budgets.download_ready).await {
            return code;
        }
        match self
            .step(
                "downloadManager",
                "downloadUpdateGame",
                json!({ "gameId": self.game_id }),
            )
            .await
        {
            Ok(StepOutcome::Completed) => info!("base files ready"),
            outcome => return failure_code(outcome, EXIT_DOWNLOAD_FAILED, "download"),
        }

        // 2. Instance configuration.
        if let Err(code) = self.ready("configManager", self.budgets.module_ready).await {
            return code;
        }
        match self
            .step(
                "configManager",
                "downloadUpdateRepo",
                json!({ "gameId": self.game_id, "instanceId": self.instance_id }),
            )
            .await
        {
            Ok(StepOutcome::Completed) => info!("config layer ready"),
            outcome => return failure_code(outcome, EXIT_CONFIG_FAILED, "config fetch"),
        }

        // 3. Merged view.
        if let Err(code) = self.ready("overlayManager", self.budgets.module_ready).await {
            return code;
        }
        match self
            .step(
                "overlayManager",
                "setupMount",
                json!({ "gameId": self.game_id, "instanceId": self.instance_id }),
            )
            .await
        {
            Ok(StepOutcome::Completed) => info!("merged view mounted"),
            Ok(StepOutcome::AlreadyMounted) => {
                error!("instance is already mounted elsewhere");
                return EXIT_ALREADY_MOUNTED;
            }
            outcome => return failure_code(outcome, EXIT_MOUNT_FAILED, "mount"),
        }

        // 4. The game itself; retained until it exits or we are told to
        // shut down.
        if let Err(code) = self.ready("gameManager", self.budgets.module_ready).await {
            return code;
        }
        match self
            .step(
                "gameManager",
                "start",
                json!({ "gameId": self.game_id, "instanceId": self.instance_id }),
            )
            .await
        {
            Ok(StepOutcome::Completed) | Ok(StepOutcome::Canceled) => {
                info!("game process finished");
                EXIT_OK
            }
            Ok(StepOutcome::AlreadyMounted) => EXIT_OK,
            Ok(StepOutcome::Failed(message)) => {
                error!("game start failed: {message}");
                EXIT_MOUNT_FAILED
            }
            Err(e) => {
                error!("game start failed: {e}");
                EXIT_MOUNT_FAILED
            }
        }
    }

    async fn ready(&self, module: &str, budget: Duration) -> Result<(), i32> {
        match rpc::wait_for_module(&self.bus, IDENT, module, budget).await {
            Ok(reply) => {
                info!(module, uptime = reply.uptime, "module ready");
                Ok(())
            }
            Err(e) => {
                error!(module, "module not ready: {e}");
                Err(EXIT_MODULE_TIMEOUT)
            }
        }
    }

    /// Issue one request and follow it to its terminal message. A
    /// duplicate-task nack deflects onto the in-flight task's channel.
    async fn step(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<StepOutcome, RpcError> {
        let fields = payload
            .as_object()
            .cloned()
            .unwrap_or_default();
        let mut pending = rpc::request(&self.bus, IDENT, target, operation, fields)?;

        match pending.await_ack(self.budgets.ack).await? {
            ReplyEvent::Ack(_) => self.follow(&mut pending).await,
            ReplyEvent::Nack(payload) => {
                if payload
                    .get("alreadyMounted")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    return Ok(StepOutcome::AlreadyMounted);
                }
                if let Some(channel) = payload.get("subscribeTo").and_then(|v| v.as_str()) {
                    info!(channel, "joining task already in flight");
                    let channel = channel.to_string();
                    pending.abandon();
                    return self.follow_channel(&channel).await;
                }
                Ok(StepOutcome::Failed(payload.to_string()))
            }
            ReplyEvent::Error(payload) => Ok(StepOutcome::Failed(describe_error(&payload))),
            _ => unreachable!("await_ack only returns ack/nack/error"),
        }
    }

    async fn follow(&self, pending: &mut PendingRequest) -> Result<StepOutcome, RpcError> {
        let terminal = pending
            .await_final(self.budgets.task, |event| {
                if let ReplyEvent::Output(line) = event {
                    tracing::debug!(line = %line, "task output");
                }
            })
            .await?;
        Ok(map_terminal(terminal))
    }

    /// Late-attach to a task someone else started.
    async fn follow_channel(&self, channel: &str) -> Result<StepOutcome, RpcError> {
        let mut sub = self.bus.subscribe(&format!("{channel}.#"));
        let deadline = tokio::time::Instant::now() + self.budgets.task;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| RpcError::ReplyTimeout {
                    reply_to: channel.to_string(),
                })?;
            let message = sub
                .recv_timeout(remaining)
                .await
                .map_err(|_| RpcError::ReplyTimeout {
                    reply_to: channel.to_string(),
                })?
                .ok_or_else(|| RpcError::StreamClosed {
                    reply_to: channel.to_string(),
                })?;
            let suffix = message.topic.rsplit('.').next().unwrap_or_default();
            match suffix {
                "finalStatus" => {
                    self.bus.unsubscribe(sub.id);
                    return Ok(map_terminal(ReplyEvent::FinalStatus(message.payload)));
                }
                "error" => {
                    self.bus.unsubscribe(sub.id);
                    return Ok(StepOutcome::Failed(describe_error(&message.payload)));
                }
                _ => {}
            }
        }
    }

    /// Best-effort cancellation of whichever sub-task is active. Only one
    /// can be; the others answer with a harmless nack.
    fn cancel_in_flight(&self) {
        for (target, operation, payload) in [
            (
                "downloadManager",
                "cancelDownload",
                json!({ "game": self.game_id }),
            ),
            (
                "gameManager",
                "stop",
                json!({ "gameId": self.game_id, "instanceId": self.instance_id }),
            ),
        ] {
            let fields = payload.as_object().cloned().unwrap_or_default();
            if let Ok(pending) = rpc::request(&self.bus, IDENT, target, operation, fields) {
                pending.abandon();
            }
        }
    }
}

fn map_terminal(event: ReplyEvent) -> StepOutcome {
    match event {
        ReplyEvent::FinalStatus(payload) => {
            match payload.get("reason").and_then(|v| v.as_str()) {
                Some("completed") => StepOutcome::Completed,
                Some("canceled") => StepOutcome::Canceled,
                other => StepOutcome::Failed(format!("terminal reason: {other:?}")),
            }
        }
        ReplyEvent::Error(payload) => StepOutcome::Failed(describe_error(&payload)),
        other => StepOutcome::Failed(format!("unexpected terminal event: {other:?}")),
    }
}

fn describe_error(payload: &serde_json::Value) -> String {
    payload
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

fn failure_code(
    outcome: Result<StepOutcome, RpcError>,
    code: i32,
    stage: &str,
) -> i32 {
    match outcome {
        Ok(StepOutcome::Failed(message)) => error!("{stage} failed: {message}"),
        Ok(StepOutcome::Canceled) => error!("{stage} was canceled"),
        Ok(StepOutcome::AlreadyMounted) => error!("{stage} refused: already mounted"),
        Ok(StepOutcome::Completed) => unreachable!("completed is handled by the caller"),
        Err(e) => error!("{stage} failed: {e}"),
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SteamLogin;
    use crate::rpc::{Liveness, Pinger, ReplySub, RequestEnvelope};
    use std::time::Instant;

    fn settings(root: &std::path::Path) -> Settings {
        Settings {
            manager_tmpdir: root.join("tmp"),
            server_files_root: root.join("files"),
            game_id: Some("csgo".to_string()),
            instance_id: Some("main-1".to_string()),
            steamcmd_files_force: false,
            server_files_force: false,
            server_config_files_force: false,
            steam_login: SteamLogin::Anonymous,
            steamcmd_twofactor_enabled: false,
            steamcmd_initial_download_validate: false,
            server_config_repo: None,
            server_config_ssh_key: None,
            steamcmd_download_url: "http://127.0.0.1:1/unused.tgz".to_string(),
        }
    }

    fn fast_budgets() -> LifecycleBudgets {
        LifecycleBudgets {
            download_ready: Duration::from_millis(800),
            module_ready: Duration::from_millis(800),
            ack: Duration::from_secs(5),
            task: Duration::from_secs(10),
        }
    }

    /// Behavior of a fake manager operation.
    #[derive(Clone, Copy)]
    enum Reply {
        Completed,
        ErrorMessage,
        NackAlreadyMounted,
    }

    /// A fake manager: a backdated pinger plus a one-operation responder.
    async fn spawn_fake_manager(
        bus: Arc<MessageBus>,
        module: &'static str,
        operation: &'static str,
        reply: Reply,
    ) -> (Pinger, tokio::task::JoinHandle<()>) {
        let liveness = Liveness::with_start(module, Instant::now() - Duration::from_secs(10));
        liveness.set_status(crate::rpc::LivenessStatus::Ready);
        let pinger = Pinger::spawn(Arc::clone(&bus), liveness);

        let mut sub = bus.subscribe(&format!("{module}.{operation}"));
        let responder_bus = Arc::clone(&bus);
        let responder = tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                let Ok(envelope) = RequestEnvelope::from_value(&message.payload) else {
                    continue;
                };
                match reply {
                    Reply::Completed => {
                        responder_bus
                            .publish(
                                &envelope.reply_topic(ReplySub::Ack),
                                json!({"subscribeTo": envelope.reply_to}),
                            )
                            .unwrap();
                        responder_bus
                            .publish(
                                &envelope.reply_topic(ReplySub::FinalStatus),
                                json!({"reason": "completed"}),
                            )
                            .unwrap();
                    }
                    Reply::ErrorMessage => {
                        responder_bus
                            .publish(
                                &envelope.reply_topic(ReplySub::Error),
                                json!({"message": "it broke"}),
                            )
                            .unwrap();
                    }
                    Reply::NackAlreadyMounted => {
                        responder_bus
                            .publish(
                                &envelope.reply_topic(ReplySub::Nack),
                                json!({"alreadyMounted": true}),
                            )
                            .unwrap();
                    }
                }
            }
        });
        (pinger, responder)
    }

    async fn run_with_managers(
        root: &std::path::Path,
        managers: Vec<(&'static str, &'static str, Reply)>,
    ) -> i32 {
        let settings = settings(root);
        let manager_bus = Arc::new(MessageBus::new(settings.ipc_dir()).unwrap());

        let mut cleanups = Vec::new();
        for (module, operation, reply) in managers {
            cleanups.push(
                spawn_fake_manager(Arc::clone(&manager_bus), module, operation, reply).await,
            );
        }

        let coordinator = LifecycleCoordinator::with_budgets(
            settings,
            SignalHub::disconnected(),
            fast_budgets(),
        )
        .unwrap();
        let code = coordinator.run().await;

        for (pinger, responder) in cleanups {
            pinger.stop().await;
            responder.abort();
        }
        manager_bus.stop_watching().await;
        code
    }

    #[tokio::test]
    async fn test_full_sequence_success() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_with_managers(
            tmp.path(),
            vec![
                ("downloadManager", "downloadUpdateGame", Reply::Completed),
                ("configManager", "downloadUpdateRepo", Reply::Completed),
                ("overlayManager", "setupMount", Reply::Completed),
                ("gameManager", "start", Reply::Completed),
            ],
        )
        .await;
        assert_eq!(code, EXIT_OK);
    }

    #[tokio::test]
    async fn test_absent_download_manager_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_with_managers(tmp.path(), vec![]).await;
        assert_eq!(code, EXIT_MODULE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_download_error_maps_to_exit_3() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_with_managers(
            tmp.path(),
            vec![("downloadManager", "downloadUpdateGame", Reply::ErrorMessage)],
        )
        .await;
        assert_eq!(code, EXIT_DOWNLOAD_FAILED);
    }

    #[tokio::test]
    async fn test_config_error_maps_to_exit_4() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_with_managers(
            tmp.path(),
            vec![
                ("downloadManager", "downloadUpdateGame", Reply::Completed),
                ("configManager", "downloadUpdateRepo", Reply::ErrorMessage),
            ],
        )
        .await;
        assert_eq!(code, EXIT_CONFIG_FAILED);
    }

    #[tokio::test]
    async fn test_already_mounted_maps_to_exit_6() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_with_managers(
            tmp.path(),
            vec![
                ("downloadManager", "downloadUpdateGame", Reply::Completed),
                ("configManager", "downloadUpdateRepo", Reply::Completed),
                ("overlayManager", "setupMount", Reply::NackAlreadyMounted),
            ],
        )
        .await;
        assert_eq!(code, EXIT_ALREADY_MOUNTED);
    }

    #[tokio::test]
    async fn test_second_coordinator_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings(tmp.path());
        let locks = LockService::new(settings.lock_dir()).unwrap();
        locks.acquire("lifecycleManager-csgo-main-1").unwrap();

        let coordinator = LifecycleCoordinator::with_budgets(
            settings,
            SignalHub::disconnected(),
            fast_budgets(),
        )
        .unwrap();
        assert_eq!(coordinator.run().await, EXIT_SELF_LOCK);
    }

    #[tokio::test]
    async fn test_missing_instance_id_is_setup_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = settings(tmp.path());
        settings.instance_id = None;
        let err = LifecycleCoordinator::with_budgets(
            settings,
            SignalHub::disconnected(),
            fast_budgets(),
        )
        .err()
        .unwrap();
        assert_eq!(err, EXIT_SELF_LOCK);
    }
}
