//! Download driver for the Steam content tool.
//!
//! Drives `steamcmd` end to end: bootstrap the tool if absent, render a
//! non-interactive run script, spawn the tool on a pseudo-terminal, turn
//! its output into `output`/`progress` streams, and apply the exit-code
//! policy:
//!
//! - `0`: download complete
//! - [`SELF_UPDATE_EXIT_CODE`]: the tool replaced itself and must be
//!   re-run with the same script (bounded by
//!   [`MAX_SELF_UPDATE_RESTARTS`] to avoid an update loop)
//! - anything else: failure; files are left in place for diagnosis
//! - exit after a cancel request: canceled, not an error

mod bootstrap;
mod progress;
mod pty;
mod script;

pub use bootstrap::{ensure_tool, is_executable, TOOL_LIB_DIR, TOOL_SCRIPT};
pub use progress::{parse_progress_line, ProgressSnapshot, ProgressStage};
pub use pty::{PtyChild, PtyEvent};
pub use script::ScriptBuilder;

use std::path::PathBuf;

use portable_pty::CommandBuilder;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SteamLogin;
use crate::fetch::FetchError;
use crate::signals::SignalHub;
use crate::task::{TaskContext, TaskError, TaskOutcome, TaskWorker};

/// Exit code the tool uses after replacing its own binaries.
pub const SELF_UPDATE_EXIT_CODE: u32 = 42;

/// Cap on consecutive self-update restarts.
pub const MAX_SELF_UPDATE_RESTARTS: u32 = 5;

/// Errors raised by the download driver.
#[derive(Debug, Error)]
pub enum SteamError {
    #[error("content tool bootstrap failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Bootstrap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("content tool exited with code {code:?}")]
    Tool { code: Option<u32> },

    #[error("content tool kept self-updating after {0} restarts")]
    SelfUpdateLoop(u32),

    #[error("{0}")]
    Unsupported(String),
}

/// Everything one download task needs.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Game id (the task key); used for script naming and logging.
    pub game_id: String,
    /// App id passed to `app_update`.
    pub app_id: u32,
    /// Base-layer directory the tool installs into.
    pub install_dir: PathBuf,
    /// Content tool directory.
    pub tool_dir: PathBuf,
    /// Login material.
    pub login: SteamLogin,
    /// Run `app_update` with validation.
    pub validate: bool,
    /// Remove and reinstall the tool first.
    pub force_tool: bool,
    /// Remove the base layer before downloading.
    pub force_server_files: bool,
    /// Tarball URL for tool bootstrap.
    pub download_url: String,
    /// Two-factor auth requested (always rejected).
    pub twofactor: bool,
}

/// The download task worker.
pub struct SteamDownloadWorker {
    pub request: DownloadRequest,
    pub hub: SignalHub,
}

impl TaskWorker for SteamDownloadWorker {
    async fn run(self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        let game_id = self.request.game_id.clone();
        match execute(self.request, self.hub, &ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(SteamError::Unsupported(message)) => Err(TaskError::Unsupported(message)),
            Err(e) => {
                warn!(game_id = %game_id, "download failed: {e}");
                Err(TaskError::Failed(e.to_string()))
            }
        }
    }
}

async fn execute(
    request: DownloadRequest,
    hub: SignalHub,
    ctx: &TaskContext,
) -> Result<TaskOutcome, SteamError> {
    if request.twofactor {
        return Err(SteamError::Unsupported(
            "two-factor authentication is not supported".to_string(),
        ));
    }

    if request.force_server_files {
        ctx.line(format!(
            "removing server files at {}",
            request.install_dir.display()
        ));
        match std::fs::remove_dir_all(&request.install_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SteamError::Io(e)),
        }
    }
    std::fs::create_dir_all(&request.install_dir)?;

    if ensure_tool(&request.tool_dir, &request.download_url, request.force_tool).await? {
        ctx.line("content tool installed".to_string());
    }

    let script_path = request
        .tool_dir
        .join(format!("runscript-{}.txt", request.game_id));
    ScriptBuilder::new(&request.install_dir, request.login.clone(), request.app_id)
        .validate(request.validate)
        .write_to(&script_path)?;

    for attempt in 0..=MAX_SELF_UPDATE_RESTARTS {
        let run = run_tool_once(&request, &script_path, &hub, ctx).await?;
        if run.canceled {
            info!(game_id = %request.game_id, "download canceled");
            return Ok(TaskOutcome::Canceled);
        }
        match run.code {
            Some(0) => {
                info!(game_id = %request.game_id, "download complete");
                return Ok(TaskOutcome::Completed);
            }
            Some(SELF_UPDATE_EXIT_CODE) => {
                debug!(game_id = %request.game_id, attempt, "tool self-updated, restarting");
                ctx.line("content tool self-updated, restarting".to_string());
            }
            code => return Err(SteamError::Tool { code }),
        }
    }
    Err(SteamError::SelfUpdateLoop(MAX_SELF_UPDATE_RESTARTS))
}

struct ToolRun {
    code: Option<u32>,
    canceled: bool,
}

async fn run_tool_once(
    request: &DownloadRequest,
    script_path: &std::path::Path,
    hub: &SignalHub,
    ctx: &TaskContext,
) -> Result<ToolRun, SteamError> {
    let mut cmd = CommandBuilder::new(request.tool_dir.join(TOOL_SCRIPT));
    cmd.arg("+runscript");
    cmd.arg(script_path);
    cmd.cwd(&request.tool_dir);
    // The tool ships its own 32-bit runtime.
    cmd.env(
        "LD_LIBRARY_PATH",
        request.tool_dir.join(TOOL_LIB_DIR).as_os_str(),
    );

    let mut child = PtyChild::spawn(cmd)?;
    let pid = child.pid();
    if let Some(pid) = pid {
        hub.set_forward_target(pid);
    }

    let mut cancel_requested = false;
    let code = loop {
        tokio::select! {
            event = child.next_event() => match event {
                Some(PtyEvent::Line(line)) => {
                    if let Some(snapshot) = parse_progress_line(&line) {
                        ctx.progress(json!(snapshot));
                    }
                    ctx.line(line);
                }
                Some(PtyEvent::Exit { code }) => break code,
                None => break None,
            },
            // `child` is borrowed by the event future; signal by pid.
            _ = ctx.cancel.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                ctx.line("cancel requested, terminating content tool".to_string());
                if let Some(pid) = pid {
                    // SAFETY: plain kill(2) with SIGTERM.
                    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM); }
                }
            }
        }
    };
    hub.clear_forward_target();

    Ok(ToolRun {
        code,
        canceled: cancel_requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Drop a fake executable `steamcmd.sh` into a fresh tool directory.
    fn fake_tool(dir: &std::path::Path, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let script = dir.join(TOOL_SCRIPT);
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn test_request(tmp: &tempfile::TempDir) -> DownloadRequest {
        DownloadRequest {
            game_id: "csgo".to_string(),
            app_id: 740,
            install_dir: tmp.path().join("base/csgo"),
            tool_dir: tmp.path().join("steamcmd"),
            login: SteamLogin::Anonymous,
            validate: false,
            force_tool: false,
            force_server_files: false,
            download_url: "http://127.0.0.1:1/unused.tgz".to_string(),
            twofactor: false,
        }
    }

    fn test_ctx() -> (
        TaskContext,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<serde_json::Value>,
        CancellationToken,
    ) {
        let (output, output_rx) = mpsc::unbounded_channel();
        let (progress, progress_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            TaskContext {
                output,
                progress,
                cancel: cancel.clone(),
            },
            output_rx,
            progress_rx,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_successful_run_emits_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let request = test_request(&tmp);
        fake_tool(
            &request.tool_dir,
            r"printf ' Update state (0x61) downloading, progress: 50.00 (500 / 1000)\r\n'; \
              printf 'Success! App fully installed.\r\n'; exit 0",
        );

        let (ctx, mut output_rx, mut progress_rx, _cancel) = test_ctx();
        let outcome = execute(request, SignalHub::disconnected(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        drop(ctx);
        let mut lines = Vec::new();
        while let Some(line) = output_rx.recv().await {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.contains("Success!")));

        let progress = progress_rx.recv().await.unwrap();
        assert_eq!(progress["stage"], json!("game-download"));
        assert_eq!(progress["percent"], json!(50.0));
    }

    #[tokio::test]
    async fn test_self_update_exit_code_respawns() {
        let tmp = tempfile::tempdir().unwrap();
        let request = test_request(&tmp);
        // First run exits with the self-update sentinel, second succeeds.
        fake_tool(
            &request.tool_dir,
            r#"marker="$0.selfupdated"
if [ ! -f "$marker" ]; then
  touch "$marker"
  printf '[ 50%%] Downloading update (100 of 200 KB)...\r\n'
  exit 42
fi
printf 'Success! App fully installed.\r\n'
exit 0"#,
        );

        let (ctx, _output_rx, mut progress_rx, _cancel) = test_ctx();
        let outcome = execute(request, SignalHub::disconnected(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        drop(ctx);
        let progress = progress_rx.recv().await.unwrap();
        assert_eq!(progress["stage"], json!("tool-self-update"));
    }

    #[tokio::test]
    async fn test_self_update_loop_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let request = test_request(&tmp);
        fake_tool(&request.tool_dir, "exit 42");

        let (ctx, _output_rx, _progress_rx, _cancel) = test_ctx();
        let err = execute(request, SignalHub::disconnected(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SteamError::SelfUpdateLoop(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let request = test_request(&tmp);
        fake_tool(&request.tool_dir, "printf 'No subscription\\r\\n'; exit 8");

        let (ctx, _output_rx, _progress_rx, _cancel) = test_ctx();
        let err = execute(request, SignalHub::disconnected(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SteamError::Tool { code: Some(8) }));
    }

    #[tokio::test]
    async fn test_cancel_terminates_tool_within_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let request = test_request(&tmp);
        fake_tool(&request.tool_dir, "sleep 30");

        let (ctx, _output_rx, _progress_rx, cancel) = test_ctx();
        let task = tokio::spawn(async move {
            execute(request, SignalHub::disconnected(), &ctx).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let started = std::time::Instant::now();
        cancel.cancel();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("cancel must be honored promptly")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Canceled);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_twofactor_is_rejected_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        let mut request = test_request(&tmp);
        request.twofactor = true;

        let (ctx, _output_rx, _progress_rx, _cancel) = test_ctx();
        let err = execute(request, SignalHub::disconnected(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SteamError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_force_server_files_removes_install_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut request = test_request(&tmp);
        request.force_server_files = true;
        std::fs::create_dir_all(&request.install_dir).unwrap();
        std::fs::write(request.install_dir.join("stale.vpk"), "old").unwrap();
        fake_tool(&request.tool_dir, "exit 0");

        let (ctx, _output_rx, _progress_rx, _cancel) = test_ctx();
        execute(request.clone(), SignalHub::disconnected(), &ctx)
            .await
            .unwrap();
        assert!(!request.install_dir.join("stale.vpk").exists());
    }
}
