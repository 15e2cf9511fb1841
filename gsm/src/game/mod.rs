//! Game process supervision.
//!
//! Builds the launch plan for an instance from its manifest and instance
//! configuration, spawns the server binary inside the merged view, streams
//! its stdout/stderr to the bus, and terminates it on request (SIGTERM,
//! then SIGKILL after a grace window).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::DEFAULT_STOP_GRACE_SECS;
use crate::manifest::{GameManifest, InstanceConfig};
use crate::signals::SignalHub;
use crate::task::{TaskContext, TaskError, TaskOutcome, TaskWorker};

/// Errors raised while launching or supervising the game process.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fully resolved command line for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Prepended to `LD_LIBRARY_PATH` for the child.
    pub library_dir: PathBuf,
}

impl LaunchPlan {
    /// Assemble the plan from manifest, instance config and merged view.
    ///
    /// Instance overrides win over manifest values; a full
    /// `cmdline_override` replaces the assembled argument list outright.
    pub fn build(manifest: &GameManifest, instance: &InstanceConfig, merged: &Path) -> Self {
        let bin_dir = instance
            .bin_dir_override
            .as_deref()
            .unwrap_or(&manifest.bin_dir);
        let bin_name = instance
            .bin_name_override
            .as_deref()
            .unwrap_or(&manifest.bin_name);
        let bin_dir_abs = merged.join(bin_dir);

        let args = match &instance.cmdline_override {
            Some(cmdline) => cmdline.split_whitespace().map(str::to_string).collect(),
            None => {
                let mut args = vec![
                    "-port".to_string(),
                    instance.port.to_string(),
                    "+maxplayers".to_string(),
                    instance.maxplayers.to_string(),
                ];
                if let Some(map) = instance.extra_str("startupMap") {
                    args.push("+map".to_string());
                    args.push(map.to_string());
                }
                if let Some(rcon) = &instance.rcon {
                    args.push("+rcon_password".to_string());
                    args.push(rcon.clone());
                }
                args
            }
        };

        Self {
            program: bin_dir_abs.join(bin_name),
            args,
            cwd: merged.to_path_buf(),
            library_dir: bin_dir_abs,
        }
    }
}

/// The game task worker: spawn, stream, wait, terminate.
#[derive(Debug)]
pub struct GameWorker {
    pub plan: LaunchPlan,
    pub hub: SignalHub,
    pub stop_grace: Duration,
}

impl GameWorker {
    pub fn new(plan: LaunchPlan, hub: SignalHub) -> Self {
        Self {
            plan,
            hub,
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
        }
    }
}

impl TaskWorker for GameWorker {
    async fn run(self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        run_game(self.plan, self.hub, self.stop_grace, &ctx)
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))
    }
}

async fn run_game(
    plan: LaunchPlan,
    hub: SignalHub,
    stop_grace: Duration,
    ctx: &TaskContext,
) -> Result<TaskOutcome, GameError> {
    let library_path = match std::env::var("LD_LIBRARY_PATH") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}:{existing}", plan.library_dir.display())
        }
        _ => plan.library_dir.display().to_string(),
    };

    info!(program = %plan.program.display(), "starting game process");
    let mut child = tokio::process::Command::new(&plan.program)
        .args(&plan.args)
        .current_dir(&plan.cwd)
        .env("LD_LIBRARY_PATH", library_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| GameError::Spawn {
            program: plan.program.display().to_string(),
            source,
        })?;

    let pid = child.id();
    if let Some(pid) = pid {
        hub.set_forward_target(pid);
    }

    // Both output pipes stream to the task's output channel.
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, ctx.output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, ctx.output.clone()));
    }

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = ctx.cancel.cancelled() => None,
    };

    let outcome = match waited {
        Some(status) => {
            let status = status?;
            ctx.line(format!("game process exited: {status}"));
            info!(%status, "game process exited");
            TaskOutcome::Completed
        }
        None => {
            ctx.line("stop requested, sending SIGTERM".to_string());
            if let Some(pid) = pid {
                // SAFETY: plain kill(2) with SIGTERM.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(stop_grace, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    info!(%status, "game process stopped");
                }
                Err(_elapsed) => {
                    warn!("game process ignored SIGTERM for {stop_grace:?}, killing");
                    ctx.line("grace window expired, sending SIGKILL".to_string());
                    child.start_kill()?;
                    let _ = child.wait().await;
                }
            }
            TaskOutcome::Canceled
        }
    };

    hub.clear_forward_target();
    for reader in readers {
        let _ = reader.await;
    }
    Ok(outcome)
}

fn spawn_line_reader<R: tokio::io::AsyncRead + Unpin + Send + 'static>(
    pipe: R,
    output: tokio::sync::mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = output.send(line);
        }
    })
}
